use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ChartListResult, JobListResult};
use crate::domain::DownloadJob;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_charts(result: &ChartListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_job(job: &DownloadJob) -> io::Result<()> {
        Self::print_json(job)
    }

    pub fn print_jobs(result: &JobListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
