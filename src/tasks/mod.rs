pub mod balance_monitor;
