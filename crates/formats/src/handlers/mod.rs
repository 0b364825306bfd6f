pub mod conf_lines;
pub mod npvt;
pub mod opaque_bundle;
