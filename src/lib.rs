pub mod smp;
pub mod stepper;
