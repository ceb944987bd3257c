pub mod blobs;
pub mod devices;
pub mod processes;
pub mod records;
pub mod sessions;
