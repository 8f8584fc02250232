use crate::domain::transaction::PaymentReport;
use crate::error::{PaymentError, Result};
use std::io::Write;

/// Writes payment outcomes as `commit_hash,side,amount,status` rows.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes every report and flushes the sink.
    ///
    /// The header row is written even when there are no reports.
    pub fn write_reports<'a>(
        &mut self,
        reports: impl IntoIterator<Item = &'a PaymentReport>,
    ) -> Result<()> {
        let mut wrote_any = false;
        for report in reports {
            self.writer.serialize(report)?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer
                .write_record(["commit_hash", "side", "amount", "status"])?;
        }
        self.writer.flush().map_err(PaymentError::from)
    }
}
