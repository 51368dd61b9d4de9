//! Training Metrics Log
//!
//! Every loss evaluation is appended to a CSV file and echoed through the
//! `log` facade.
//!
//! ## CSV Format
//!
//! - `step`: training iteration
//! - `elapsed_seconds`: time since the logger was created
//! - `learning_rate`
//! - `train_loss`, `val_loss`: mean cross-entropy estimates
//! - `train_perplexity`, `val_perplexity`: `exp(loss)`
//! - `sample`: a short generated text, quoted
//!
//! Rows are flushed as soon as they are written, so an interrupted run keeps
//! its history.
//!
//! ## Perplexity
//!
//! A model guessing uniformly over a 65-character vocabulary has perplexity
//! 65 (loss ≈ 4.17). A perfect model has perplexity 1.

use crate::error::Result;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

pub const CSV_HEADER: &str =
    "step,elapsed_seconds,learning_rate,train_loss,val_loss,train_perplexity,val_perplexity,sample";

/// One row of the metrics log.
#[derive(Clone, Debug)]
pub struct EvalRecord<'a> {
    pub step: usize,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub val_loss: f32,
    pub sample: Option<&'a str>,
}

pub struct TrainingLogger {
    out: Box<dyn Write + Send>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create (or truncate) a CSV file and write the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Self::from_writer(BufWriter::new(file))
    }

    /// Log to any writer, e.g. an in-memory buffer.
    pub fn from_writer(out: impl Write + Send + 'static) -> Result<Self> {
        let mut out: Box<dyn Write + Send> = Box::new(out);
        writeln!(out, "{CSV_HEADER}")?;
        out.flush()?;

        let now = Instant::now();
        Ok(Self {
            out,
            start_time: now,
            last_log_time: now,
        })
    }

    pub fn log(&mut self, record: &EvalRecord<'_>) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let train_perplexity = record.train_loss.exp();
        let val_perplexity = record.val_loss.exp();
        let sample_escaped = record
            .sample
            .map(|s| s.replace('"', "\"\""))
            .unwrap_or_default();

        writeln!(
            self.out,
            "{},{:.2},{:.6},{:.4},{:.4},{:.2},{:.2},\"{}\"",
            record.step,
            elapsed,
            record.learning_rate,
            record.train_loss,
            record.val_loss,
            train_perplexity,
            val_perplexity,
            sample_escaped
        )?;
        self.out.flush()?;

        let since_last = self.last_log_time.elapsed().as_secs_f32();
        info!(
            "step {:5} | {:7.1}s (+{:.1}s) | lr {:.2e} | train {:.4} | val {:.4} | val ppl {:.2}",
            record.step,
            elapsed,
            since_last,
            record.learning_rate,
            record.train_loss,
            record.val_loss,
            val_perplexity
        );
        if let Some(text) = record.sample {
            info!("sample: {text:?}");
        }

        self.last_log_time = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Writer that keeps everything it receives, shared with the test.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_header_and_rows() {
        let buf = Shared::default();
        let mut logger = TrainingLogger::from_writer(buf.clone()).unwrap();
        logger
            .log(&EvalRecord {
                step: 500,
                learning_rate: 3e-4,
                train_loss: 0.0,
                val_loss: 1.0,
                sample: Some("say \"hi\"\nnow"),
            })
            .unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.starts_with("500,"));
        assert!(row.contains(",0.000300,0.0000,1.0000,1.00,2.72,"));
        assert!(text.contains("\"say \"\"hi\"\"\nnow\""));
    }

    #[test]
    fn test_create_writes_file() {
        let path = std::env::temp_dir().join(format!("puck-log-{}.csv", std::process::id()));
        {
            let mut logger = TrainingLogger::create(&path).unwrap();
            logger
                .log(&EvalRecord {
                    step: 0,
                    learning_rate: 1e-3,
                    train_loss: 4.0,
                    val_loss: 4.1,
                    sample: None,
                })
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().ends_with(",\"\""));
        std::fs::remove_file(&path).unwrap();
    }
}
