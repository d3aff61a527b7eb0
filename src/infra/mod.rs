pub mod docker;
pub mod fs_store;
pub mod memory_store;
pub mod web;
