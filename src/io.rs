//! Trace export. Currently CSV, behind the `csv` feature.

#[cfg(feature = "csv")]
use std::error::Error;
#[cfg(feature = "csv")]
use std::fs::File;
#[cfg(feature = "csv")]
use std::path::Path;

#[cfg(feature = "csv")]
use csv::Writer;

#[cfg(feature = "csv")]
use crate::sampler::SampleTrace;

/// Saves retained draws as a long-format CSV file.
///
/// The header row is `chain,sample,<component...>`, with one column per
/// monitored component (e.g. `theta`, `p[1]`, `p[2]`); each subsequent row
/// is one retained draw of one chain.
///
/// # Errors
///
/// Returns an error if the file cannot be created or a row cannot be
/// written.
#[cfg(feature = "csv")]
pub fn save_csv(traces: &[&SampleTrace], path: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let file = File::create(path)?;
    let mut writer = Writer::from_writer(file);

    let mut header = vec!["chain".to_string(), "sample".to_string()];
    if let Some(first) = traces.first() {
        header.extend(first.components().iter().cloned());
    }
    writer.write_record(&header)?;

    for (chain, trace) in traces.iter().enumerate() {
        for (sample, row) in trace.draws().outer_iter().enumerate() {
            let mut record = vec![chain.to_string(), sample.to_string()];
            record.extend(row.iter().map(|x| x.to_string()));
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(all(test, feature = "csv"))]
mod tests {
    use super::*;
    use crate::graph::{DataBindings, Graph};
    use crate::sampler::{GibbsSampler, RunConfig};

    #[test]
    fn writes_header_and_one_row_per_draw() {
        let data = DataBindings::new().scalar("x", 3.1);
        let graph = Graph::compile(
            "model {
                theta ~ dnorm(2.3, 4.0)
                x ~ dnorm(theta, 1.5625)
            }",
            &data,
        )
        .unwrap();
        let config = RunConfig {
            n_chains: 2,
            n_iterations: 10,
            burn_in: 5,
            ..RunConfig::default()
        };
        let traces = GibbsSampler::new(&graph, config)
            .unwrap()
            .run()
            .expect_complete()
            .unwrap();
        let refs: Vec<&SampleTrace> = traces.iter().collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        save_csv(&refs, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("chain,sample,theta"));
        assert_eq!(lines.count(), 10);
    }
}
