//! Market data acquisition.
//!
//! The engine never reads series directly; produced scripts embed them. The
//! [`SyntheticDataSource`] gives a reproducible dataset for mock mode and
//! tests: the same symbol and window always yield the same bars.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EvoError, Result};

/// Rows shown in a [`DataSample`] tail, per symbol.
pub const SAMPLE_TAIL_ROWS: usize = 5;

/// Inclusive calendar window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(EvoError::DataSource(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// January 1st of `today`'s year through `today`.
    pub fn year_to_date(today: NaiveDate) -> Self {
        let start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
        Self { start, end: today }
    }
}

/// One daily bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Bars for one symbol, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSeries {
    pub symbol: String,
    pub bars: Vec<Bar>,
}

/// Series for every requested symbol, in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub series: Vec<SymbolSeries>,
}

impl Dataset {
    pub fn symbols(&self) -> Vec<&str> {
        self.series.iter().map(|s| s.symbol.as_str()).collect()
    }

    pub fn total_rows(&self) -> usize {
        self.series.iter().map(|s| s.bars.len()).sum()
    }

    /// Compact JSON object `{symbol: [bar, ...]}` for embedding in scripts.
    pub fn to_embedded_json(&self) -> Result<String> {
        let mut map = serde_json::Map::new();
        for s in &self.series {
            map.insert(s.symbol.clone(), serde_json::to_value(&s.bars)?);
        }
        Ok(serde_json::to_string(&map)?)
    }

    /// Descriptor attached to iteration records.
    pub fn sample(&self) -> DataSample {
        let start = self
            .series
            .iter()
            .filter_map(|s| s.bars.first().map(|b| b.date))
            .min();
        let end = self
            .series
            .iter()
            .filter_map(|s| s.bars.last().map(|b| b.date))
            .max();
        let tail = self
            .series
            .iter()
            .flat_map(|s| {
                let skip = s.bars.len().saturating_sub(SAMPLE_TAIL_ROWS);
                s.bars[skip..].iter().map(move |bar| TailRow {
                    symbol: s.symbol.clone(),
                    bar: bar.clone(),
                })
            })
            .collect();
        DataSample {
            symbols: self.series.iter().map(|s| s.symbol.clone()).collect(),
            rows: self.total_rows(),
            columns: ["date", "open", "high", "low", "close", "volume"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            start,
            end,
            tail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailRow {
    pub symbol: String,
    #[serde(flatten)]
    pub bar: Bar,
}

/// Shape of the data a case ran against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    pub symbols: Vec<String>,
    pub rows: usize,
    pub columns: Vec<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub tail: Vec<TailRow>,
}

/// Supplier of tabular time series per symbol.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &'static str;

    /// Series for each of `symbols` within `window`.
    async fn fetch(&self, symbols: &[String], window: &DateWindow) -> Result<Dataset>;
}

/// Deterministic random-walk prices seeded from the symbol name.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDataSource;

impl SyntheticDataSource {
    pub fn new() -> Self {
        Self
    }

    fn series(symbol: &str, window: &DateWindow) -> SymbolSeries {
        let digest = Sha256::digest(symbol.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = XorShift::new(u64::from_le_bytes(seed));

        let mut close = 50.0 + rng.next_f64() * 450.0;
        let mut bars = Vec::new();
        let mut day = window.start;
        while day <= window.end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let open = close;
                let change = (rng.next_f64() - 0.48) * 0.05;
                close = (open * (1.0 + change)).max(1.0);
                let spread = open.max(close) * rng.next_f64() * 0.02;
                let high = open.max(close) + spread;
                let low = (open.min(close) - spread).max(0.5);
                let volume = 1_000_000 + (rng.next_f64() * 49_000_000.0) as u64;
                bars.push(Bar {
                    date: day,
                    open: round2(open),
                    high: round2(high),
                    low: round2(low),
                    close: round2(close),
                    volume,
                });
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        SymbolSeries {
            symbol: symbol.to_string(),
            bars,
        }
    }
}

#[async_trait]
impl DataSource for SyntheticDataSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn fetch(&self, symbols: &[String], window: &DateWindow) -> Result<Dataset> {
        if symbols.is_empty() {
            return Err(EvoError::DataSource("no symbols requested".to_string()));
        }
        Ok(Dataset {
            series: symbols.iter().map(|s| Self::series(s, window)).collect(),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// xorshift64* generator; enough for reproducible fake prices.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        XorShift(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
