pub mod api;
pub mod events;
pub mod kpi;
pub mod models;
