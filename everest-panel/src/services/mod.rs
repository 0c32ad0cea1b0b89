pub mod delete_backup;
