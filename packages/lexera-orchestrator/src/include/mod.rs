pub mod loader;
pub mod resolver;
pub mod scanner;
pub mod slide_parser;
pub mod syntax;
