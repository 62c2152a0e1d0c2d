pub mod accounts;
pub mod config;
pub mod db;
pub mod gmail;
pub mod models;
pub mod oauth;
pub mod output;
pub mod sealed;
