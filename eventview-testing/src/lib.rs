//! Test support for `EventView` backends and workers
//!
//! - [`contract`]: behavioral suite every [`eventview_types::Backend`] must
//!   pass, instantiated per backend with [`backend_contract_tests!`]
//! - [`chaos`]: wrappers injecting infrastructure failures into an event
//!   source or backend

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_variables
)]

pub mod chaos;
pub mod contract;

pub use chaos::*;
