// Copyright 2025 Cornell University
// released under MIT License

pub mod c_ast;
pub mod cfa;
pub mod cpa;
pub mod diagnostic;
pub mod errors;
pub mod interpreter;
pub mod ir;
pub mod parser;
pub mod query;
pub mod serialize;
pub mod setup;
pub mod trace_parser;
