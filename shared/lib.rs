#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod progress;

pub mod shared {
    pub use super::progress;
}

#[path = "../metric/mod.rs"]
pub mod metric;

#[path = "../predictions/mod.rs"]
pub mod predictions;

#[path = "../stacking/mod.rs"]
pub mod stacking;
