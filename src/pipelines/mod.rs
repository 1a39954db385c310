pub mod aggregate;
pub mod cluster;
pub mod denoise;
pub mod dispatcher;
pub mod inputs;
pub mod preprocess;
pub mod sample;
