//! Knowledge prompts for circuit discovery
//!
//! Each example is a templated prompt about a subject followed by the
//! expected answer, e.g. `"The capital of France is" + " Paris"`. Sampling
//! is deterministic for a given seed.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::model::KnowledgeTokenizer;

/// Kind of knowledge a prompt probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeType {
    Factual,
    Commonsense,
    Linguistic,
    Bias,
}

impl KnowledgeType {
    pub const ALL: [KnowledgeType; 4] = [
        KnowledgeType::Factual,
        KnowledgeType::Commonsense,
        KnowledgeType::Linguistic,
        KnowledgeType::Bias,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeType::Factual => "factual",
            KnowledgeType::Commonsense => "commonsense",
            KnowledgeType::Linguistic => "linguistic",
            KnowledgeType::Bias => "bias",
        }
    }

    /// Prompt templates; `{}` is replaced by the subject
    pub fn templates(self) -> &'static [&'static str] {
        match self {
            KnowledgeType::Factual => &[
                "The capital of {} is",
                "{} has its capital in the city of",
                "The capital city of {} is called",
                "The government of {} is seated in",
            ],
            KnowledgeType::Commonsense => &[
                "The color of {} is",
                "Everyone knows that {} are",
                "In nature, {} are usually",
            ],
            KnowledgeType::Linguistic => &[
                "The opposite of {} is",
                "The antonym of {} is",
                "{} is the opposite of",
            ],
            KnowledgeType::Bias => &[
                "The people of {} are known for their",
                "Visitors to {} usually remember the",
            ],
        }
    }

    /// `(subject, answer)` pairs
    pub fn facts(self) -> &'static [(&'static str, &'static str)] {
        match self {
            KnowledgeType::Factual => &[
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Italy", "Rome"),
                ("Spain", "Madrid"),
                ("Japan", "Tokyo"),
                ("Canada", "Ottawa"),
                ("Egypt", "Cairo"),
                ("Russia", "Moscow"),
                ("Greece", "Athens"),
                ("Norway", "Oslo"),
            ],
            KnowledgeType::Commonsense => &[
                ("grass", "green"),
                ("snow", "white"),
                ("the sky", "blue"),
                ("bananas", "yellow"),
                ("coal", "black"),
                ("tomatoes", "red"),
            ],
            KnowledgeType::Linguistic => &[
                ("hot", "cold"),
                ("up", "down"),
                ("big", "small"),
                ("fast", "slow"),
                ("early", "late"),
                ("open", "closed"),
            ],
            KnowledgeType::Bias => &[
                ("Italy", "food"),
                ("France", "wine"),
                ("Brazil", "football"),
                ("Japan", "technology"),
                ("Switzerland", "chocolate"),
            ],
        }
    }
}

impl fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnowledgeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown knowledge type {s}"))
    }
}

/// Parameters of one dataset draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeDatasetConfig {
    pub knowledge_type: KnowledgeType,
    /// Number of examples
    pub n: usize,
    /// How many distinct templates to draw prompts from
    pub nb_templates: usize,
    pub seed: u64,
}

/// Tokenized knowledge prompts with their answers
#[derive(Debug, Clone)]
pub struct KnowledgeDataset {
    config: KnowledgeDatasetConfig,
    prompts: Vec<String>,
    answers: Vec<String>,
    /// Index of the last prompt token in each row
    answer_positions: Vec<usize>,
    toks: Tensor,
    answer_mask: Tensor,
}

impl KnowledgeDataset {
    /// Sample `config.n` prompts and tokenize `prompt + " " + answer`,
    /// right-padded with the tokenizer's pad id.
    pub fn new(
        config: KnowledgeDatasetConfig,
        tokenizer: &KnowledgeTokenizer,
        device: &Device,
    ) -> Result<Self> {
        let all_templates = config.knowledge_type.templates();
        anyhow::ensure!(config.n > 0, "Dataset needs at least one example");
        anyhow::ensure!(
            (1..=all_templates.len()).contains(&config.nb_templates),
            "nb_templates must be between 1 and {} for {}, got {}",
            all_templates.len(),
            config.knowledge_type,
            config.nb_templates
        );

        let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
        let templates: Vec<&str> = all_templates
            .choose_multiple(&mut rng, config.nb_templates)
            .copied()
            .collect();
        let facts = config.knowledge_type.facts();

        let mut prompts = Vec::with_capacity(config.n);
        let mut answers = Vec::with_capacity(config.n);
        let mut rows = Vec::with_capacity(config.n);
        let mut answer_positions = Vec::with_capacity(config.n);

        for _ in 0..config.n {
            let template = templates[rng.gen_range(0..templates.len())];
            let (subject, answer) = facts[rng.gen_range(0..facts.len())];
            let prompt = template.replace("{}", subject);

            let prompt_len = tokenizer.encode(&prompt)?.len();
            anyhow::ensure!(prompt_len > 0, "Prompt '{prompt}' tokenized to nothing");
            let ids = tokenizer.encode(&format!("{prompt} {answer}"))?;
            anyhow::ensure!(
                ids.len() > prompt_len,
                "Answer '{answer}' added no tokens to '{prompt}'"
            );

            answer_positions.push(prompt_len - 1);
            rows.push(ids);
            prompts.push(prompt);
            answers.push(answer.to_string());
        }

        let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let pad = tokenizer.pad_token_id();
        let mut flat_toks = Vec::with_capacity(config.n * max_len);
        let mut flat_mask = vec![0u8; config.n * max_len];
        for (i, row) in rows.iter().enumerate() {
            flat_toks.extend_from_slice(row);
            flat_toks.extend(std::iter::repeat(pad).take(max_len - row.len()));
            flat_mask[i * max_len + answer_positions[i]] = 1;
        }

        let toks = Tensor::from_vec(flat_toks, (config.n, max_len), device)?;
        let answer_mask = Tensor::from_vec(flat_mask, (config.n, max_len), device)?;
        debug!(
            "{} dataset: {} examples, {} positions",
            config.knowledge_type, config.n, max_len
        );

        Ok(Self {
            config,
            prompts,
            answers,
            answer_positions,
            toks,
            answer_mask,
        })
    }

    /// Tokens `[n, max_len]` (`U32`)
    pub fn toks(&self) -> &Tensor {
        &self.toks
    }

    /// 1 at the position that predicts the answer's first token (`U8`)
    pub fn answer_mask(&self) -> &Tensor {
        &self.answer_mask
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn answers(&self) -> &[String] {
        &self.answers
    }

    pub fn answer_positions(&self) -> &[usize] {
        &self.answer_positions
    }

    pub fn config(&self) -> &KnowledgeDatasetConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}
