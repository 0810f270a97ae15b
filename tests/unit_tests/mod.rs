mod config;
mod topology;
mod validation;
