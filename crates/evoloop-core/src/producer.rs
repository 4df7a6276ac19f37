//! Code producers: turn a subject's versioned spec into a runnable script.
//!
//! - [`TemplateProducer`]: deterministic Python templates, no external service
//! - [`GenerativeProducer`]: delegates to a [`TextGenerator`] and extracts the
//!   first fenced code block from the reply

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use evoloop_state::{tail_chars, Subject, VersionedState};

use crate::catalog::known_capabilities;
use crate::data::Dataset;
use crate::error::{EvoError, Result};
use crate::llm::{ChatMessage, GenerationRequest, TextGenerator};

/// Everything a producer may look at for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ProductionSpec<'a> {
    pub subject: Subject,
    /// State of `subject`.
    pub state: &'a VersionedState,
    /// State of the other subject.
    pub companion: &'a VersionedState,
    pub symbols: &'a [String],
    pub dataset: &'a Dataset,
    /// Error tail of the previous failed attempt in this turn.
    pub repair_hint: Option<&'a str>,
    /// Most recent critic feedback, oldest first.
    pub critic_feedback: &'a [String],
    pub user_feedback: Option<&'a str>,
}

impl<'a> ProductionSpec<'a> {
    pub fn visual_state(&self) -> &'a VersionedState {
        match self.subject {
            Subject::Visual => self.state,
            Subject::Data => self.companion,
        }
    }

    pub fn data_state(&self) -> &'a VersionedState {
        match self.subject {
            Subject::Visual => self.companion,
            Subject::Data => self.state,
        }
    }

    /// Same spec for the other subject.
    pub fn for_subject(&self, subject: Subject) -> ProductionSpec<'a> {
        if subject == self.subject {
            return *self;
        }
        ProductionSpec {
            subject,
            state: self.companion,
            companion: self.state,
            ..*self
        }
    }
}

/// Produces source text for a subject. Returning `Err` or empty text counts
/// as a failed attempt.
#[async_trait]
pub trait CodeProducer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn produce(&self, spec: &ProductionSpec<'_>) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Template producer
// ---------------------------------------------------------------------------

/// Deterministic, template-driven producer. Ignores repair hints since its
/// output depends only on the states and the dataset.
#[derive(Debug, Clone, Default)]
pub struct TemplateProducer;

impl TemplateProducer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CodeProducer for TemplateProducer {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn produce(&self, spec: &ProductionSpec<'_>) -> Result<String> {
        render_template(spec)
    }
}

/// Render the standalone Python script for `spec`.
pub fn render_template(spec: &ProductionSpec<'_>) -> Result<String> {
    let visual = spec.visual_state();
    let data = spec.data_state();
    let visual_caps = visual.capability_names();
    let data_caps = data.capability_names();
    let own_caps = spec.state.capability_names();

    let known = known_capabilities(spec.subject);
    let ignored: Vec<&str> = own_caps
        .iter()
        .map(String::as_str)
        .filter(|c| !known.iter().any(|k| k == c))
        .collect();

    let dataset_json = spec.dataset.to_embedded_json()?;
    let mut out = String::new();

    out.push_str("#!/usr/bin/env python3\n");
    let _ = writeln!(
        out,
        "# evoloop {} script, version v{}",
        spec.subject,
        spec.state.version()
    );
    let _ = writeln!(out, "# Symbols: {}", comment_text(&spec.symbols.join(", ")));
    let _ = writeln!(
        out,
        "# Active capabilities: {}",
        comment_list(&own_caps.iter().map(String::as_str).collect::<Vec<_>>())
    );
    let _ = writeln!(out, "# Ignored capabilities: {}", comment_list(&ignored));
    out.push_str("import json\nimport math\n\n");
    let _ = writeln!(
        out,
        "DATASET = json.loads({})",
        serde_json::to_string(&dataset_json)?
    );
    let _ = writeln!(
        out,
        "VISUAL_CAPABILITIES = {}",
        serde_json::to_string(&visual_caps)?
    );
    let _ = writeln!(
        out,
        "DATA_CAPABILITIES = {}",
        serde_json::to_string(&data_caps)?
    );
    out.push('\n');

    let safe_access = spec.state.contains("safe_column_access");
    out.push_str(if safe_access {
        PY_SAFE_ACCESS
    } else {
        PY_DIRECT_ACCESS
    });
    out.push_str(PY_ANALYTICS);
    out.push_str(if spec.state.contains("empty_data_guard") {
        PY_GUARDED_SERIES
    } else {
        PY_RAW_SERIES
    });
    out.push_str(PY_ENRICH);

    match spec.subject {
        Subject::Visual => {
            out.push_str(PY_RENDER);
            out.push_str(PY_VISUAL_MAIN);
        }
        Subject::Data => out.push_str(PY_DATA_MAIN),
    }

    Ok(out)
}

fn comment_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn comment_list(items: &[&str]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        comment_text(&items.join(", "))
    }
}

const PY_DIRECT_ACCESS: &str = r##"
def field(row, name):
    return float(row[name])


def column(rows, name):
    return [field(row, name) for row in rows]

"##;

const PY_SAFE_ACCESS: &str = r##"
def field(row, name):
    value = row.get(name)
    if value is None:
        return None
    try:
        return float(value)
    except (TypeError, ValueError):
        return None


def column(rows, name):
    out = []
    last = None
    for row in rows:
        value = field(row, name)
        if value is None:
            value = last if last is not None else 0.0
        out.append(value)
        last = value
    return out

"##;

const PY_ANALYTICS: &str = r##"
def ytd_change(values):
    if not values:
        return []
    base = values[0]
    if base == 0:
        return [0.0 for _ in values]
    return [(v / base - 1.0) * 100.0 for v in values]


def moving_average(values, window):
    out = []
    total = 0.0
    for i, v in enumerate(values):
        total += v
        if i >= window:
            total -= values[i - window]
        out.append(total / window if i + 1 >= window else None)
    return out


def returns(values):
    return [
        (values[i] / values[i - 1] - 1.0) if values[i - 1] else 0.0
        for i in range(1, len(values))
    ]


def rsi(values, period=14):
    out = [None] * len(values)
    if len(values) <= period:
        return out
    gains = 0.0
    losses = 0.0
    for i in range(1, period + 1):
        delta = values[i] - values[i - 1]
        if delta >= 0:
            gains += delta
        else:
            losses -= delta
    avg_gain = gains / period
    avg_loss = losses / period
    for i in range(period, len(values)):
        if i > period:
            delta = values[i] - values[i - 1]
            avg_gain = (avg_gain * (period - 1) + max(delta, 0.0)) / period
            avg_loss = (avg_loss * (period - 1) + max(-delta, 0.0)) / period
        if avg_loss == 0:
            out[i] = 100.0
        else:
            out[i] = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    return out


def volatility(values, window=20):
    rets = returns(values)
    out = [None] * len(values)
    for i in range(window, len(values)):
        chunk = rets[i - window:i]
        mean = sum(chunk) / window
        var = sum((r - mean) ** 2 for r in chunk) / max(window - 1, 1)
        out[i] = math.sqrt(var) * math.sqrt(252) * 100.0
    return out


def correlation(a, b):
    ra = returns(a)
    rb = returns(b)
    n = min(len(ra), len(rb))
    if n < 2:
        return None
    ra = ra[-n:]
    rb = rb[-n:]
    mean_a = sum(ra) / n
    mean_b = sum(rb) / n
    cov = sum((x - mean_a) * (y - mean_b) for x, y in zip(ra, rb))
    dev_a = math.sqrt(sum((x - mean_a) ** 2 for x in ra))
    dev_b = math.sqrt(sum((y - mean_b) ** 2 for y in rb))
    if dev_a == 0 or dev_b == 0:
        return None
    return cov / (dev_a * dev_b)

"##;

const PY_RAW_SERIES: &str = r##"
SERIES = dict(DATASET)

"##;

const PY_GUARDED_SERIES: &str = r##"
SERIES = {}
for _symbol, _rows in DATASET.items():
    _rows = [r for r in (_rows or []) if field(r, "close") is not None]
    if len(_rows) < 2:
        print("skipping %s: not enough rows" % _symbol)
        continue
    SERIES[_symbol] = _rows
if not SERIES:
    print("no usable data for any symbol")

"##;

const PY_ENRICH: &str = r##"
def enrich(symbol, rows):
    closes = column(rows, "close")
    record = {
        "symbol": symbol,
        "dates": [row.get("date") for row in rows],
        "close": closes,
        "ytd_pct": ytd_change(closes),
    }
    if "moving_avg" in DATA_CAPABILITIES:
        record["ma20"] = moving_average(closes, 20)
        record["ma50"] = moving_average(closes, 50)
    if "rsi" in DATA_CAPABILITIES:
        record["rsi14"] = rsi(closes)
    if "volatility" in DATA_CAPABILITIES:
        record["volatility20"] = volatility(closes)
    if "volume" in DATA_CAPABILITIES or "volume" in VISUAL_CAPABILITIES:
        record["volume"] = column(rows, "volume")
    return record


ENRICHED = {symbol: enrich(symbol, rows) for symbol, rows in SERIES.items()}
CORRELATIONS = {}
if "correlation" in DATA_CAPABILITIES:
    _names = list(ENRICHED)
    for _i in range(len(_names)):
        for _j in range(_i + 1, len(_names)):
            _a, _b = _names[_i], _names[_j]
            CORRELATIONS[_a + "/" + _b] = correlation(
                ENRICHED[_a]["close"], ENRICHED[_b]["close"]
            )


def write_enriched():
    with open("enriched_data.json", "w") as fh:
        json.dump({"series": ENRICHED, "correlations": CORRELATIONS}, fh)

"##;

const PY_RENDER: &str = r##"
def esc(text):
    return str(text).replace("&", "&amp;").replace("<", "&lt;").replace(">", "&gt;")


def peak_points(values):
    if not values:
        return []
    hi = max(range(len(values)), key=lambda i: values[i])
    lo = min(range(len(values)), key=lambda i: values[i])
    return [(hi, values[hi], "high"), (lo, values[lo], "low")]


def chart_style():
    chosen = "default"
    for cap in VISUAL_CAPABILITIES:
        if cap.startswith("style_"):
            chosen = cap[len("style_"):]
    return chosen


def render_matplotlib():
    import matplotlib
    matplotlib.use("Agg")
    import matplotlib.pyplot as plt

    try:
        plt.style.use(chart_style())
    except (OSError, ValueError):
        pass

    show_volume = "volume" in VISUAL_CAPABILITIES
    if show_volume:
        fig, (ax, vax) = plt.subplots(
            2, 1, figsize=(12, 8), sharex=True, gridspec_kw={"height_ratios": [3, 1]}
        )
    else:
        fig, ax = plt.subplots(figsize=(12, 6))
        vax = None
    for symbol, record in ENRICHED.items():
        ys = record["ytd_pct"]
        xs = list(range(len(ys)))
        line, = ax.plot(xs, ys, label=symbol)
        if "moving_avg" in VISUAL_CAPABILITIES:
            for window, style in ((20, "--"), (50, ":")):
                pts = [(x, y) for x, y in zip(xs, moving_average(ys, window)) if y is not None]
                if pts:
                    ax.plot(
                        [p[0] for p in pts],
                        [p[1] for p in pts],
                        linestyle=style,
                        color=line.get_color(),
                        alpha=0.7,
                        label="%s MA%d" % (symbol, window),
                    )
        if "peaks" in VISUAL_CAPABILITIES:
            for x, y, kind in peak_points(ys):
                ax.scatter(
                    [x], [y], color=line.get_color(), marker="^" if kind == "high" else "v", zorder=3
                )
        if "annotate" in VISUAL_CAPABILITIES and ys:
            ax.annotate(
                "%s %.1f%%" % (symbol, ys[-1]),
                xy=(xs[-1], ys[-1]),
                xytext=(5, 0),
                textcoords="offset points",
            )
        if vax is not None and "volume" in record:
            vax.bar(xs, record["volume"], alpha=0.4, label=symbol)
    ax.set_title("YTD %% change: %s" % ", ".join(ENRICHED))
    ax.set_ylabel("YTD change (%)")
    ax.grid(True, alpha=0.3)
    if ENRICHED:
        ax.legend()
    if vax is not None:
        vax.set_ylabel("Volume")
    fig.tight_layout()
    fig.savefig("ytd_stock_gains.png")
    plt.close(fig)
    return "ytd_stock_gains.png"


def render_svg():
    width, height = 900, 500
    plot_h = 340 if "volume" in VISUAL_CAPABILITIES else 440
    colors = ["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b"]
    values = [v for record in ENRICHED.values() for v in record["ytd_pct"]]
    lo = min(values) if values else 0.0
    hi = max(values) if values else 1.0
    if hi == lo:
        hi = lo + 1.0
    longest = max([len(record["ytd_pct"]) for record in ENRICHED.values()] + [2])

    def sx(i):
        return 50 + i * (width - 100) / (longest - 1)

    def sy(v):
        return 30 + (hi - v) * (plot_h - 40) / (hi - lo)

    parts = [
        '<svg xmlns="http://www.w3.org/2000/svg" width="%d" height="%d">' % (width, height),
        '<rect width="100%" height="100%" fill="white"/>',
        '<text x="%d" y="20" font-size="16" text-anchor="middle">YTD %% change: %s</text>'
        % (width // 2, esc(", ".join(ENRICHED))),
    ]
    for n, (symbol, record) in enumerate(ENRICHED.items()):
        color = colors[n % len(colors)]
        ys = record["ytd_pct"]
        pts = " ".join("%.1f,%.1f" % (sx(i), sy(v)) for i, v in enumerate(ys))
        parts.append(
            '<polyline fill="none" stroke="%s" stroke-width="2" points="%s"/>' % (color, pts)
        )
        if "moving_avg" in VISUAL_CAPABILITIES:
            for window, dash in ((20, "6,3"), (50, "2,3")):
                mpts = " ".join(
                    "%.1f,%.1f" % (sx(i), sy(v))
                    for i, v in enumerate(moving_average(ys, window))
                    if v is not None
                )
                if mpts:
                    parts.append(
                        '<polyline fill="none" stroke="%s" stroke-dasharray="%s" points="%s"/>'
                        % (color, dash, mpts)
                    )
        if "peaks" in VISUAL_CAPABILITIES:
            for i, v, kind in peak_points(ys):
                parts.append(
                    '<circle cx="%.1f" cy="%.1f" r="4" fill="%s"><title>%s %s</title></circle>'
                    % (sx(i), sy(v), color, esc(symbol), kind)
                )
        if "annotate" in VISUAL_CAPABILITIES and ys:
            parts.append(
                '<text x="%.1f" y="%.1f" font-size="11" fill="%s">%s %.1f%%</text>'
                % (sx(len(ys) - 1) + 4, sy(ys[-1]), color, esc(symbol), ys[-1])
            )
        parts.append(
            '<text x="%d" y="%d" font-size="12" fill="%s">%s</text>'
            % (60 + 90 * n, height - 8, color, esc(symbol))
        )
        if "volume" in VISUAL_CAPABILITIES and "volume" in record:
            vols = record["volume"]
            peak = max(vols) if vols else 0
            base = height - 30
            for i, vol in enumerate(vols):
                bar = (vol / peak) * (height - plot_h - 60) if peak else 0
                parts.append(
                    '<rect x="%.1f" y="%.1f" width="2" height="%.1f" fill="%s" opacity="0.4"/>'
                    % (sx(i) + n * 2, base - bar, bar, color)
                )
    parts.append("</svg>")
    with open("ytd_stock_gains.svg", "w") as fh:
        fh.write("\n".join(parts))
    return "ytd_stock_gains.svg"

"##;

const PY_VISUAL_MAIN: &str = r##"
def main():
    try:
        output = render_matplotlib()
    except ImportError:
        output = render_svg()
    write_enriched()
    print("wrote %s for %d symbol(s)" % (output, len(ENRICHED)))
    for symbol, record in ENRICHED.items():
        if record["ytd_pct"]:
            print("%s YTD: %.2f%%" % (symbol, record["ytd_pct"][-1]))


if __name__ == "__main__":
    main()
"##;

const PY_DATA_MAIN: &str = r##"
def main():
    write_enriched()
    for symbol, record in ENRICHED.items():
        summary = [symbol]
        if record["ytd_pct"]:
            summary.append("ytd=%.2f%%" % record["ytd_pct"][-1])
        for key in ("ma20", "rsi14", "volatility20"):
            values = [v for v in record.get(key, []) if v is not None]
            if values:
                summary.append("%s=%.2f" % (key, values[-1]))
        print(" ".join(summary))
    for pair, value in CORRELATIONS.items():
        if value is not None:
            print("corr %s=%.3f" % (pair, value))


if __name__ == "__main__":
    main()
"##;

// ---------------------------------------------------------------------------
// Generative producer
// ---------------------------------------------------------------------------

/// Longest repair hint passed back to the writer.
const REPAIR_HINT_CHARS: usize = 600;

/// Producer backed by a text-generation model.
pub struct GenerativeProducer {
    generator: Arc<dyn TextGenerator>,
    model: String,
    temperature: Option<f32>,
}

impl GenerativeProducer {
    pub fn new(generator: Arc<dyn TextGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
            temperature: Some(0.2),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Writer prompt for one attempt.
    pub fn build_request(&self, spec: &ProductionSpec<'_>) -> Result<GenerationRequest> {
        let visual = spec.visual_state();
        let data = spec.data_state();
        let mut prompt = String::new();

        let _ = writeln!(
            prompt,
            "Generate a standalone Python 3 script ({} artifact) for a year-to-date stock analysis of: {}.",
            spec.subject,
            spec.symbols.join(", ")
        );
        let _ = writeln!(
            prompt,
            "Visual spec v{}: {}",
            visual.version(),
            capability_summary(visual)
        );
        let _ = writeln!(
            prompt,
            "Data spec v{}: {}",
            data.version(),
            capability_summary(data)
        );
        prompt.push_str("Requirements:\n");
        prompt.push_str("- Embed the dataset below (JSON keyed by symbol; rows have date, open, high, low, close, volume).\n");
        prompt.push_str("- Compute YTD % change from the first trading day in the data.\n");
        match spec.subject {
            Subject::Visual => prompt.push_str(
                "- Save the chart as ytd_stock_gains.png (matplotlib, Agg backend) with title, legend, labels and grid.\n",
            ),
            Subject::Data => prompt.push_str(
                "- Write the enriched series to enriched_data.json and print a short summary.\n",
            ),
        }
        prompt.push_str("- Implement every active capability; silently ignore unknown ones.\n");
        prompt.push_str("- No network access, no interactive display, no Streamlit.\n");

        if !spec.critic_feedback.is_empty() {
            prompt.push_str("Recent critic feedback:\n");
            for (n, feedback) in spec.critic_feedback.iter().enumerate() {
                let _ = writeln!(prompt, "{}. {}", n + 1, feedback.trim());
            }
        }
        if let Some(user) = spec.user_feedback {
            let _ = writeln!(prompt, "Latest user feedback:\n{}", user.trim());
        }
        if let Some(hint) = spec.repair_hint {
            let _ = writeln!(
                prompt,
                "Previous error to fix:\n{}",
                tail_chars(hint, REPAIR_HINT_CHARS)
            );
            prompt.push_str("Ensure indentation and try/except blocks are syntactically correct.\n");
        }
        let _ = writeln!(prompt, "Dataset:\n{}", spec.dataset.to_embedded_json()?);
        prompt.push_str("Return only the code in a single ```python block.");

        Ok(GenerationRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(
                    "You write correct, self-contained Python scripts for financial charts and data enrichment.",
                ),
                ChatMessage::user(prompt),
            ],
            temperature: self.temperature,
        })
    }
}

#[async_trait]
impl CodeProducer for GenerativeProducer {
    fn name(&self) -> &'static str {
        "generative"
    }

    async fn produce(&self, spec: &ProductionSpec<'_>) -> Result<String> {
        let request = self.build_request(spec)?;
        let reply = self.generator.generate(&request).await?;
        let code = extract_code(&reply);
        if code.is_empty() {
            return Err(EvoError::Producer(
                "generator reply contained no code".to_string(),
            ));
        }
        Ok(code)
    }
}

fn capability_summary(state: &VersionedState) -> String {
    let names = state.capability_names();
    if names.is_empty() {
        "basic".to_string()
    } else {
        names.join(", ")
    }
}

fn python_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*(?:python3?|py)[ \t]*\r?\n(.*?)```").expect("valid regex")
    })
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("valid regex"))
}

/// First ```python block, else the first fenced block, else the trimmed text.
pub fn extract_code(reply: &str) -> String {
    let fenced = python_fence()
        .captures(reply)
        .or_else(|| any_fence().captures(reply))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    fenced.unwrap_or(reply).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, SymbolSeries};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn dataset() -> Dataset {
        let bar = |day: u32, close: f64| Bar {
            date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000,
        };
        Dataset {
            series: vec![SymbolSeries {
                symbol: "NVDA".to_string(),
                bars: vec![bar(2, 100.0), bar(5, 110.0)],
            }],
        }
    }

    fn spec<'a>(
        subject: Subject,
        state: &'a VersionedState,
        companion: &'a VersionedState,
        symbols: &'a [String],
        dataset: &'a Dataset,
    ) -> ProductionSpec<'a> {
        ProductionSpec {
            subject,
            state,
            companion,
            symbols,
            dataset,
            repair_hint: None,
            critic_feedback: &[],
            user_feedback: None,
        }
    }

    #[tokio::test]
    async fn template_is_deterministic() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let visual = VersionedState::seeded(["moving_avg"]);
        let data = VersionedState::initial();
        let s = spec(Subject::Visual, &visual, &data, &symbols, &ds);
        let producer = TemplateProducer::new();
        let a = producer.produce(&s).await.unwrap();
        let b = producer.produce(&s).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("# evoloop visual script, version v1"));
        assert!(a.contains("VISUAL_CAPABILITIES = [\"moving_avg\"]"));
        assert!(a.contains("def render_svg():"));
    }

    #[test]
    fn unknown_capabilities_are_listed_as_ignored() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let visual = VersionedState::seeded(["peaks", "sparkles"]);
        let data = VersionedState::initial();
        let code = render_template(&spec(Subject::Visual, &visual, &data, &symbols, &ds)).unwrap();
        assert!(code.contains("# Ignored capabilities: sparkles"));
        assert!(code.contains("# Active capabilities: peaks, sparkles"));
    }

    #[test]
    fn defensive_capabilities_change_the_script() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let plain = VersionedState::initial();
        let guarded = VersionedState::seeded(["safe_column_access", "empty_data_guard"]);
        let base = render_template(&spec(Subject::Data, &plain, &plain, &symbols, &ds)).unwrap();
        let safe = render_template(&spec(Subject::Data, &guarded, &plain, &symbols, &ds)).unwrap();
        assert!(base.contains("return float(row[name])"));
        assert!(safe.contains("value = row.get(name)"));
        assert!(safe.contains("not enough rows"));
        assert!(!safe.contains("def render_svg"));
    }

    #[test]
    fn style_capability_selects_matplotlib_style() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let visual = VersionedState::seeded(["style_default", "style_classic"]);
        let data = VersionedState::initial();
        let code = render_template(&spec(Subject::Visual, &visual, &data, &symbols, &ds)).unwrap();
        assert!(code.contains("# Ignored capabilities: none"));
        assert!(code.contains("plt.style.use(chart_style())"));
        assert!(code.contains("VISUAL_CAPABILITIES = [\"style_default\", \"style_classic\"]"));
    }

    #[test]
    fn dataset_is_embedded_as_string_literal() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let s = VersionedState::initial();
        let code = render_template(&spec(Subject::Visual, &s, &s, &symbols, &ds)).unwrap();
        let line = code
            .lines()
            .find(|l| l.starts_with("DATASET = json.loads("))
            .unwrap();
        let literal = &line["DATASET = json.loads(".len()..line.len() - 1];
        let inner: String = serde_json::from_str(literal).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&inner).unwrap();
        assert_eq!(parsed["NVDA"][1]["close"], 110.0);
    }

    #[test]
    fn for_subject_swaps_states() {
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let visual = VersionedState::seeded(["peaks"]);
        let data = VersionedState::seeded(["rsi"]);
        let s = spec(Subject::Visual, &visual, &data, &symbols, &ds);
        let d = s.for_subject(Subject::Data);
        assert_eq!(d.subject, Subject::Data);
        assert!(d.state.contains("rsi"));
        assert!(d.visual_state().contains("peaks"));
    }

    #[test]
    fn extract_prefers_python_fence() {
        let reply = "Here:\n```text\nnope\n```\n```python\nprint('hi')\n```\n";
        assert_eq!(extract_code(reply), "print('hi')");
    }

    #[test]
    fn extract_falls_back_to_any_fence_then_text() {
        assert_eq!(extract_code("```\nx = 1\n```"), "x = 1");
        assert_eq!(extract_code("  y = 2  \n"), "y = 2");
        assert_eq!(extract_code("```python\n\n```"), "");
    }

    struct Recording {
        reply: String,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl TextGenerator for Recording {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn generative_prompt_carries_context_and_hint() {
        let generator = Arc::new(Recording {
            reply: "```python\nprint('ok')\n```".to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let producer = GenerativeProducer::new(generator.clone(), "writer-model");
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let visual = VersionedState::seeded(["volume"]);
        let data = VersionedState::initial();
        let feedback = vec!["Add 20-day MA.".to_string()];
        let s = ProductionSpec {
            repair_hint: Some("KeyError: 'Close'"),
            critic_feedback: &feedback,
            user_feedback: Some("bigger fonts"),
            ..spec(Subject::Visual, &visual, &data, &symbols, &ds)
        };

        let code = producer.produce(&s).await.unwrap();
        assert_eq!(code, "print('ok')");

        let seen = generator.seen.lock().unwrap();
        let prompt = &seen[0].messages[1].content;
        assert_eq!(seen[0].model, "writer-model");
        assert!(prompt.contains("Visual spec v1: volume"));
        assert!(prompt.contains("Data spec v1: basic"));
        assert!(prompt.contains("1. Add 20-day MA."));
        assert!(prompt.contains("bigger fonts"));
        assert!(prompt.contains("Previous error to fix:\nKeyError: 'Close'"));
    }

    #[tokio::test]
    async fn empty_generation_is_a_producer_failure() {
        let generator = Arc::new(Recording {
            reply: "   ".to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let producer = GenerativeProducer::new(generator, "m");
        let ds = dataset();
        let symbols = vec!["NVDA".to_string()];
        let s0 = VersionedState::initial();
        let err = producer
            .produce(&spec(Subject::Data, &s0, &s0, &symbols, &ds))
            .await
            .unwrap_err();
        assert!(matches!(err, EvoError::Producer(_)));
    }
}
