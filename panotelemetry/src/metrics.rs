//! Rendu texte ligne à ligne des métriques.

/// Type d'une métrique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

/// Une métrique à exposer.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Composant d'origine (`cache`, `queue`, `scheduler`, ...)
    pub component: &'static str,
    pub name: &'static str,
    pub help: &'static str,
    pub mtype: MetricType,
    pub value: f64,
}

impl Metric {
    pub fn gauge(component: &'static str, name: &'static str, help: &'static str, value: f64) -> Self {
        Self {
            component,
            name,
            help,
            mtype: MetricType::Gauge,
            value,
        }
    }

    pub fn counter(
        component: &'static str,
        name: &'static str,
        help: &'static str,
        value: f64,
    ) -> Self {
        Self {
            component,
            name,
            help,
            mtype: MetricType::Counter,
            value,
        }
    }

    fn full_name(&self) -> String {
        format!("panosign_{}_{}", self.component, self.name)
    }
}

/// Rend la liste de métriques au format texte ligne à ligne.
///
/// ```text
/// # HELP panosign_cache_ready_bytes Bytes of ready cache entries
/// # TYPE panosign_cache_ready_bytes gauge
/// panosign_cache_ready_bytes 1048576
/// ```
pub fn render_metrics(metrics: &[Metric]) -> String {
    let mut out = String::new();
    for metric in metrics {
        let name = metric.full_name();
        out.push_str(&format!("# HELP {} {}\n", name, metric.help));
        out.push_str(&format!("# TYPE {} {}\n", name, metric.mtype.as_str()));
        if metric.value.fract() == 0.0 {
            out.push_str(&format!("{} {}\n", name, metric.value as i64));
        } else {
            out.push_str(&format!("{} {}\n", name, metric.value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_format() {
        let metrics = vec![
            Metric::gauge("cache", "ready_bytes", "Bytes of ready entries", 1024.0),
            Metric::counter("cache", "hits", "Cache hits", 42.0),
        ];

        let text = render_metrics(&metrics);
        assert!(text.contains("# HELP panosign_cache_ready_bytes Bytes of ready entries\n"));
        assert!(text.contains("# TYPE panosign_cache_ready_bytes gauge\n"));
        assert!(text.contains("panosign_cache_ready_bytes 1024\n"));
        assert!(text.contains("# TYPE panosign_cache_hits counter\n"));
        assert!(text.contains("panosign_cache_hits 42\n"));
    }

    #[test]
    fn test_fractional_values_keep_decimals() {
        let text = render_metrics(&[Metric::gauge("scheduler", "jitter_p95_ms", "p95", 12.5)]);
        assert!(text.contains("panosign_scheduler_jitter_p95_ms 12.5\n"));
    }
}
