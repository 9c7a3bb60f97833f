// ABOUTME: MCP server entry (stdio) exposing the rule engine as protocol tools
// ABOUTME: Thin runtime layer wiring transports and handlers onto rulegraph-engine

pub mod official_server;

pub use official_server::*;
