pub mod aggregate;
pub mod dossier;
