pub mod args;

use clap::Parser;
pub use args::{Arguments, Command, MergeSoftware, QualityScale};

pub fn parse() -> Arguments {
    Arguments::parse()
}
