pub mod backup;
pub mod computations;
pub mod core;
pub mod courses;
pub mod departments;
pub mod results;
pub mod settings;
pub mod students;
pub mod transcripts;
