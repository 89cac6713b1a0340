pub mod errors;
pub mod models;
pub mod protocol;
pub mod validation;
