pub mod commands;
pub mod context;
pub mod fmtconv;
pub mod github;
pub mod home;
pub mod manifest;
pub mod run;
pub mod shared;
pub mod template;
pub mod workflow;
