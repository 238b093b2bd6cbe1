pub mod auth;
pub mod commit_validator;
pub mod db;
pub mod finalizer;
pub mod namespace;
pub mod part_store;
pub mod retry;
pub mod upload_manager;
pub mod upload_service;
