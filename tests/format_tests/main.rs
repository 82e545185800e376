//! On-disk format tests: header, markers and descriptor

mod descriptor_tests;
mod header_tests;
mod marker_tests;
