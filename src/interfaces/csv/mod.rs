//! CSV front end: payment legs in, payment reports out.

pub mod payment_reader;
pub mod report_writer;
