pub mod auth;
pub mod core;
pub mod courses;
pub mod grades;
pub mod reports;
pub mod students;
pub mod users;
pub mod years;
