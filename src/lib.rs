pub mod app;
pub mod cache;
pub mod catalog;
pub mod checker;
pub mod config;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod http;
pub mod hub;
pub mod mapper;
pub mod output;
pub mod prompt;
pub mod resolver;
pub mod store;
pub mod uniprot;
pub mod usi;
