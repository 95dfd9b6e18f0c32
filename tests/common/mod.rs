#![allow(dead_code)]

pub use conductor_test_utils::builders;
pub use conductor_test_utils::scripted_worker;
pub use conductor_test_utils::{init_tracing, with_timeout};
