//! Watches a college's published timetable spreadsheet, stores the current
//! week and tells students what changed.

pub mod config;
pub mod db;
pub mod diff;
pub mod format;
pub mod groups;
pub mod handlers;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod parser;
pub mod sheet;
pub mod site;
pub mod update;
