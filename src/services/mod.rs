pub mod aggregator;
pub mod approvals;
pub mod bucket_manager;
pub mod check_payment;
pub mod check_reservation;
pub mod delivery;
pub mod edi_generator;
pub mod errors;
pub mod template_expander;
pub mod threshold_monitor;
