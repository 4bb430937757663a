//! Lookups against system databases

pub mod pwnam;
pub mod servent;
