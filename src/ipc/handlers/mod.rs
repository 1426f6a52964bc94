pub mod core;
pub mod courses;
pub mod exports;
pub mod roster;
pub mod students;
pub mod submissions;
