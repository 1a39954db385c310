pub mod biom;
pub mod command;
pub mod fastx;
pub mod file;
pub mod summary;
pub mod system;
pub mod table;
pub mod tempfiles;
pub mod tools;
