//! Control loop tests driven by fake workers

mod supervisor;
