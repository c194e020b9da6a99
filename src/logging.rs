use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainError;

/// Appends scalar summaries to a TensorBoard event file in `dir`.
///
/// The file uses the standard record framing: little-endian length, masked
/// CRC of the length, the serialized event, masked CRC of the event. Any
/// TensorBoard install can load the resulting directory.
pub struct ScalarLogger {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl ScalarLogger {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainError::runtime(format!(
                "failed to create log directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainError::runtime(format!(
                "failed to create event file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    pub fn log_scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<(), TrainError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainError> {
        let mut buffer = BytesMut::with_capacity(128);
        event
            .encode(&mut buffer)
            .map_err(|err| TrainError::runtime(format!("failed to encode event: {err}")))?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| TrainError::runtime(format!("failed to write event: {err}")))?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TrainError> {
        self.writer
            .flush()
            .map_err(|err| TrainError::runtime(format!("failed to flush event file: {err}")))?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for ScalarLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_one_event_file_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = ScalarLogger::create(dir.path(), 1).unwrap();
        logger.log_scalar("train/loss", 0, 1.5).unwrap();
        drop(logger);

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("events.out.tfevents."));
    }

    #[test]
    fn record_framing_is_self_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = ScalarLogger::create(dir.path(), 1).unwrap();
        logger.log_scalar("val/accuracy", 3, 0.75).unwrap();
        logger.flush().unwrap();

        let path = fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let bytes = fs::read(path).unwrap();
        assert!(bytes.len() > 16);

        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let len_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(len_crc, masked_crc32(&bytes[..8]));

        let payload = &bytes[12..12 + len];
        let payload_crc =
            u32::from_le_bytes(bytes[12 + len..16 + len].try_into().unwrap());
        assert_eq!(payload_crc, masked_crc32(payload));

        let event = Event::decode(payload).unwrap();
        assert_eq!(event.step, 3);
        let summary = event.summary.unwrap();
        assert_eq!(summary.value[0].tag, "val/accuracy");
        assert_eq!(summary.value[0].simple_value, Some(0.75));
    }
}
