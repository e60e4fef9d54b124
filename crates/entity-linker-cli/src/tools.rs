//! Post-processing of linking output files.
//!
//! All linking files are `embedding_label,knowledgebase_id` CSV with a header.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use entity_linker_core::dispatcher::LINKED_HEADER;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ToolsCommands {
    /// Keep only ids linked in both files; write each side's labels for them.
    Intersect {
        /// First linking file.
        left: PathBuf,
        /// Second linking file.
        right: PathBuf,
        /// Output for the first file's labels.
        #[arg(long)]
        left_out: PathBuf,
        /// Output for the second file's labels.
        #[arg(long)]
        right_out: PathBuf,
    },

    /// Upper-case labels whose upper-case form is in an embedding vocabulary.
    Capitalize {
        /// Embedding vocabulary (space-delimited, unquoted, one header row).
        #[arg(long)]
        vocab: PathBuf,
        /// Linking file to rewrite.
        #[arg(long)]
        linking: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Print names of a source list that the cache has never recorded.
    Missing {
        /// Source list (CSV, header row, name in the first column).
        #[arg(long)]
        source: PathBuf,
        /// Linking cache log.
        #[arg(long)]
        cache: PathBuf,
    },
}

pub fn cmd_tools(command: ToolsCommands) -> Result<()> {
    match command {
        ToolsCommands::Intersect {
            left,
            right,
            left_out,
            right_out,
        } => {
            let shared = intersect_linkings(&left, &right, &left_out, &right_out)?;
            println!(
                "{} shared_ids={shared}",
                "Intersect".green().bold()
            );
            println!("  {} {}", "→".cyan(), left_out.display());
            println!("  {} {}", "→".cyan(), right_out.display());
            Ok(())
        }
        ToolsCommands::Capitalize {
            vocab,
            linking,
            out,
        } => {
            let rewritten = capitalize_labels(&vocab, &linking, &out)?;
            println!("{} rewritten={rewritten}", "Capitalize".green().bold());
            println!("  {} {}", "→".cyan(), out.display());
            Ok(())
        }
        ToolsCommands::Missing { source, cache } => {
            let missing = missing_in_cache(&source, &cache)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for name in &missing {
                writeln!(out, "{name}")?;
            }
            Ok(())
        }
    }
}

/// Read a linking file into `id -> labels` (labels in file order).
fn read_linking(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open linking file {}", path.display()))?;
    let mut by_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("bad row in {}", path.display()))?;
        let (Some(label), Some(id)) = (record.get(0), record.get(1)) else {
            return Err(anyhow!("row without two fields in {}", path.display()));
        };
        by_id.entry(id.to_string()).or_default().push(label.to_string());
    }
    Ok(by_id)
}

fn write_linking<'a>(
    path: &Path,
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(LINKED_HEADER)?;
    for (label, id) in pairs {
        writer.write_record([label, id])?;
    }
    writer.flush()?;
    Ok(())
}

fn intersect_linkings(left: &Path, right: &Path, left_out: &Path, right_out: &Path) -> Result<usize> {
    let left_ids = read_linking(left)?;
    let right_ids = read_linking(right)?;

    let shared: BTreeSet<&String> = left_ids
        .keys()
        .filter(|id| right_ids.contains_key(*id))
        .collect();

    for (by_id, out) in [(&left_ids, left_out), (&right_ids, right_out)] {
        let pairs = shared.iter().flat_map(|id| {
            by_id[*id]
                .iter()
                .map(move |label| (label.as_str(), id.as_str()))
        });
        write_linking(out, pairs)?;
    }

    Ok(shared.len())
}

fn capitalize_labels(vocab: &Path, linking: &Path, out: &Path) -> Result<usize> {
    let mut vocab_reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_path(vocab)
        .with_context(|| format!("failed to open vocabulary {}", vocab.display()))?;
    let mut tokens = HashSet::new();
    for record in vocab_reader.records() {
        let record = record.with_context(|| format!("bad row in {}", vocab.display()))?;
        if let Some(token) = record.get(0) {
            tokens.insert(token.to_string());
        }
    }

    let mut reader = csv::Reader::from_path(linking)
        .with_context(|| format!("failed to open linking file {}", linking.display()))?;
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut rewritten = 0;
    for record in reader.records() {
        let record = record.with_context(|| format!("bad row in {}", linking.display()))?;
        let (Some(label), Some(id)) = (record.get(0), record.get(1)) else {
            continue;
        };
        let upper = label.to_uppercase();
        if tokens.contains(&upper) {
            if upper != label {
                rewritten += 1;
            }
            pairs.push((upper, id.to_string()));
        } else {
            pairs.push((label.to_string(), id.to_string()));
        }
    }

    write_linking(out, pairs.iter().map(|(l, i)| (l.as_str(), i.as_str())))?;
    Ok(rewritten)
}

fn missing_in_cache(source: &Path, cache: &Path) -> Result<BTreeSet<String>> {
    let first_column = |path: &Path| -> Result<HashSet<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut names = HashSet::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("bad row in {}", path.display()))?;
            if let Some(name) = record.get(0) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    };

    let source_names = first_column(source)?;
    let cached = first_column(cache)?;
    Ok(source_names
        .into_iter()
        .filter(|n| !cached.contains(n))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn intersect_keeps_shared_ids_per_side() {
        let dir = tempdir().unwrap();
        let left = dir.path().join("fasttext.csv");
        let right = dir.path().join("glove.csv");
        std::fs::write(
            &left,
            "embedding_label,knowledgebase_id\ncar,Q1420\nCar,Q1420\ndog,Q144\n",
        )
        .unwrap();
        std::fs::write(&right, "embedding_label,knowledgebase_id\nCARS,Q1420\ntree,Q10884\n").unwrap();

        let left_out = dir.path().join("left_out.csv");
        let right_out = dir.path().join("right_out.csv");
        let shared = intersect_linkings(&left, &right, &left_out, &right_out).unwrap();

        assert_eq!(shared, 1);
        assert_eq!(
            std::fs::read_to_string(&left_out).unwrap(),
            "embedding_label,knowledgebase_id\ncar,Q1420\nCar,Q1420\n"
        );
        assert_eq!(
            std::fs::read_to_string(&right_out).unwrap(),
            "embedding_label,knowledgebase_id\nCARS,Q1420\n"
        );
    }

    #[test]
    fn capitalize_uses_vocabulary() {
        let dir = tempdir().unwrap();
        let vocab = dir.path().join("model.vec");
        std::fs::write(&vocab, "3 2\nNASA 0.1 0.2\ncar 0.3 0.4\n\"odd 0.5 0.6\n").unwrap();
        let linking = dir.path().join("linking.csv");
        std::fs::write(
            &linking,
            "embedding_label,knowledgebase_id\nnasa,Q23548\ncar,Q1420\n",
        )
        .unwrap();
        let out = dir.path().join("out.csv");

        let rewritten = capitalize_labels(&vocab, &linking, &out).unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "embedding_label,knowledgebase_id\nNASA,Q23548\ncar,Q1420\n"
        );
    }

    #[test]
    fn missing_lists_names_never_cached() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.csv");
        std::fs::write(&source, "title,page_id\nCar,1\nDog,2\nTree,3\n").unwrap();
        let cache = dir.path().join("cache.csv");
        std::fs::write(
            &cache,
            "entity,linked_entity,description\nCar,Q1420,vehicle\nTree,,\n",
        )
        .unwrap();

        let missing = missing_in_cache(&source, &cache).unwrap();
        assert_eq!(missing, BTreeSet::from(["Dog".to_string()]));
    }
}
