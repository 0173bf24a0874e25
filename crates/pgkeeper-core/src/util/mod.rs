//! Utility modules for pgkeeper.

mod time_parser;

pub use time_parser::{
    TimeParseError, parse_date, parse_date_with_base, parse_interval, parse_month,
    parse_retention,
};
