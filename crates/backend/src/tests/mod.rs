mod materialization;
mod optimization;
mod teardown;
