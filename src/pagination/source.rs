use super::RowPacket;
use crate::core::{ColumnMeta, Result, Row};
use crate::driver::DriverResultSet;
use log::debug;

/// Pulls packets out of a driver result set.
///
/// Keeps one row of lookahead so that the packet containing the final row
/// is the one flagged `last_part`, even when the row count is an exact
/// multiple of the packet size.
pub struct RowSource {
    result_set: Box<dyn DriverResultSet>,
    columns: Vec<ColumnMeta>,
    lookahead: Option<Row>,
    exhausted: bool,
    rows_read: u64,
}

impl RowSource {
    pub fn new(result_set: Box<dyn DriverResultSet>) -> Self {
        let columns = result_set.columns().to_vec();
        Self {
            result_set,
            columns,
            lookahead: None,
            exhausted: false,
            rows_read: 0,
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    async fn pull(&mut self) -> Result<Option<Row>> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        if self.exhausted {
            return Ok(None);
        }
        let row = self.result_set.next_row().await?;
        if row.is_some() {
            self.rows_read += 1;
        }
        Ok(row)
    }

    /// Reads up to `size` rows. An exhausted source yields an empty last
    /// packet.
    pub async fn next_packet(&mut self, size: usize) -> Result<RowPacket> {
        let size = size.max(1);
        let mut packet = RowPacket::empty(&self.columns, false);

        while packet.row_count() < size {
            match self.pull().await? {
                Some(row) => packet.push_row(row)?,
                None => {
                    self.finish().await;
                    packet.set_last_part(true);
                    return Ok(packet);
                }
            }
        }

        match self.pull().await? {
            Some(row) => self.lookahead = Some(row),
            None => {
                self.finish().await;
                packet.set_last_part(true);
            }
        }
        Ok(packet)
    }

    async fn finish(&mut self) {
        if self.exhausted {
            return;
        }
        self.exhausted = true;
        if let Err(e) = self.result_set.close().await {
            debug!("Ignoring result set close failure: {}", e);
        }
    }

    pub async fn close(&mut self) {
        self.lookahead = None;
        self.finish().await;
    }
}
