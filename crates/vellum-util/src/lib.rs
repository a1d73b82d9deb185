pub mod pagination;
pub mod snowflake;
pub mod time;
pub mod validation;
