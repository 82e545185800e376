//! Grain address translation and grain index tests

mod address_tests;
mod index_tests;
