mod budget;
mod cancellation;
mod common;
mod determinism;
mod scenarios;
mod spill;
