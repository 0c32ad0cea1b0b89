pub mod backups;
pub mod system;
