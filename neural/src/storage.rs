//! Result artifacts and run checkpoints
//!
//! Each configuration writes its own file set into the results directory:
//! - `<name>_summary.csv`: one row per round; accuracy cells empty when not evaluated
//! - `<name>_clients.csv`: per-client accuracy, one row per (evaluated round, split)
//! - `<name>_membership_r<round>.pgm`: membership snapshots on clustering events
//! - `<name>_checkpoint.json.gz`: final round state, gzip-compressed JSON

use crate::evaluation::RoundRecord;
use fedclust_core::{ClientId, FedError, MembershipMatrix, ModelParams, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Snapshot of a finished (or cancelled) run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Format version for compatibility
    pub version: u32,
    pub config_name: String,
    pub run_id: String,
    /// RFC 3339 time the checkpoint was written
    pub saved_at: String,
    /// Rounds completed so far
    pub rounds_completed: usize,
    pub params: Vec<ModelParams>,
    pub membership: MembershipMatrix,
    /// Mean training loss per round
    pub mean_losses: Vec<f64>,
    /// Training losses per client, one entry per round the client trained
    pub client_losses: Vec<Vec<f64>>,
}

impl RunCheckpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: u32 = 1;
}

/// Writes the per-configuration artifact set
pub struct ResultsWriter {
    dir: PathBuf,
    name: String,
    evaluated: Vec<ClientId>,
    summary: BufWriter<File>,
    clients: BufWriter<File>,
}

impl ResultsWriter {
    /// Create the directory (if needed) and both CSV files with headers
    pub fn create(dir: &Path, name: &str, evaluated: &[ClientId]) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut summary = BufWriter::new(File::create(dir.join(format!("{}_summary.csv", name)))?);
        writeln!(
            summary,
            "round,mean_train_loss,train_accuracy,test_accuracy,train_variance,test_variance"
        )?;

        let mut clients = BufWriter::new(File::create(dir.join(format!("{}_clients.csv", name)))?);
        let columns: Vec<String> = evaluated.iter().map(|c| format!("client_{}", c)).collect();
        writeln!(clients, "round,split,{}", columns.join(","))?;

        tracing::debug!(dir = %dir.display(), name, "Opened results files");
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            evaluated: evaluated.to_vec(),
            summary,
            clients,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a summary row for every round; per-client rows only for evaluated rounds
    ///
    /// Accuracy and variance cells stay empty when the round was not evaluated.
    pub fn record_round(&mut self, record: &RoundRecord) -> Result<()> {
        let Some(eval) = &record.evaluation else {
            writeln!(self.summary, "{},{:.6},,,,", record.round, record.mean_train_loss)?;
            return Ok(());
        };
        writeln!(
            self.summary,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            record.round,
            record.mean_train_loss,
            eval.train_accuracy,
            eval.test_accuracy,
            eval.train_variance,
            eval.test_variance
        )?;

        let mut train = Vec::with_capacity(self.evaluated.len());
        let mut test = Vec::with_capacity(self.evaluated.len());
        for client in &self.evaluated {
            let scores = eval.clients.iter().find(|c| c.client == *client).ok_or_else(|| {
                FedError::Serialization(format!("round {} has no evaluation for client {}", record.round, client))
            })?;
            train.push(format!("{:.6}", scores.train.accuracy));
            test.push(format!("{:.6}", scores.test.accuracy));
        }
        writeln!(self.clients, "{},train,{}", record.round, train.join(","))?;
        writeln!(self.clients, "{},test,{}", record.round, test.join(","))?;
        Ok(())
    }

    /// Grayscale PGM of the membership matrix: white is a member
    pub fn write_membership_snapshot(&self, round: usize, membership: &MembershipMatrix) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}_membership_r{}.pgm", self.name, round));
        let n = membership.n();
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "P2")?;
        writeln!(out, "{} {}", n, n)?;
        writeln!(out, "255")?;
        for i in 0..n {
            let row: Vec<&str> = (0..n)
                .map(|j| if membership.get(i, j) { "255" } else { "0" })
                .collect();
            writeln!(out, "{}", row.join(" "))?;
        }
        out.flush()?;
        Ok(path)
    }

    /// Write the gzip-compressed JSON checkpoint
    pub fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}_checkpoint.json.gz", self.name));
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let json = serde_json::to_string(checkpoint)?;
        encoder.write_all(json.as_bytes())?;
        encoder.finish()?;
        tracing::info!(path = %path.display(), rounds = checkpoint.rounds_completed, "Saved checkpoint");
        Ok(path)
    }

    /// Flush both CSV files
    pub fn finish(mut self) -> Result<()> {
        self.summary.flush()?;
        self.clients.flush()?;
        Ok(())
    }
}

/// Read a checkpoint written by [`ResultsWriter::save_checkpoint`]
pub fn load_checkpoint(path: &Path) -> Result<RunCheckpoint> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut json = String::new();
    decoder.read_to_string(&mut json)?;
    let checkpoint: RunCheckpoint = serde_json::from_str(&json)?;

    if checkpoint.version > RunCheckpoint::CURRENT_VERSION {
        return Err(FedError::Serialization(format!(
            "checkpoint version {} is newer than supported version {}",
            checkpoint.version,
            RunCheckpoint::CURRENT_VERSION
        )));
    }
    Ok(checkpoint)
}
