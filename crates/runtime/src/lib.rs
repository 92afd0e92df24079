pub mod access;
pub mod child;
pub mod constants;
pub mod guest;
pub mod profile;
pub mod supervisor;
pub mod utils;
