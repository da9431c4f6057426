//! Smith CLI - microcontainer builder.

pub mod commands;
