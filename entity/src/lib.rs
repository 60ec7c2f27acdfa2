//! `SeaORM` entities for the analysis backfill service.

pub mod prelude;

pub mod item;
