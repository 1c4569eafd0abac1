pub mod archive;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod domain;
pub mod download;
pub mod error;
pub mod metadata;
pub mod nifti;
pub mod nrrd;
pub mod organize;
pub mod pipeline;
pub mod registration;
pub mod store;
