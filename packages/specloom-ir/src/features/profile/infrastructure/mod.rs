pub mod deplog;
pub mod lifetime;
pub mod live;
pub mod parser;
pub mod pctx;
pub mod shadow;
pub mod writer;
