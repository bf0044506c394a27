//! CLI domain: parse, route and presentation only.
//! Exploration logic lives in the library; routes call the exploration API.

mod parse;
mod presentation;
mod route;

pub use parse::{Cli, Commands, OutputFormat};
pub use presentation::{
    format_conversation_text, format_graph_text, format_json, format_section_heading,
    format_status_text,
};
pub use route::RunContext;
