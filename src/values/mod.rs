//! Shared scalar types: tagged values and numeric series.

pub mod float_series;
pub mod tagged;
