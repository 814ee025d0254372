//! Interface de linha de comando do ymcrawl baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status) e flags
//! globais (--config, --max-concurrency, --max-attempts, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CrawlConfig;
use crate::error::CrawlError;

pub const DEFAULT_OUTPUT: &str = "save/ymgames_matched.jsonl";
pub const DEFAULT_CHECKPOINT: &str = "save/ymcrawl_checkpoint.jsonl";

/// ymcrawl: casa registros de jogos com o arquivo YMGal, com controle de
/// congestionamento e retomada por checkpoint.
#[derive(Debug, Parser)]
#[command(name = "ymcrawl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: ./ymcrawl.toml, se existir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Limite superior de requisições simultâneas.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Tentativas por item antes de abandoná-lo.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa um arquivo de registros (JSON ou JSON Lines).
    Run {
        /// Arquivo de entrada com os registros de jogos.
        input: PathBuf,

        /// Arquivo JSON Lines onde os resultados são acrescentados.
        #[arg(long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,

        /// Grava os registros sem correspondência neste arquivo, em vez de
        /// junto com os resultados.
        #[arg(long)]
        unmatched: Option<PathBuf>,

        /// Log de checkpoint usado para retomar execuções.
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,

        /// Busca pelos aliases em vez dos nomes japonês/chinês.
        #[arg(long)]
        aliases: bool,

        /// Readmite itens marcados como Failed ou Abandoned no checkpoint.
        #[arg(long)]
        retry_abandoned: bool,
    },

    /// Mostra o estado do checkpoint.
    Status {
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,
    },
}

impl Cli {
    /// Applies flag overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut CrawlConfig) -> Result<(), CrawlError> {
        if let Some(max) = self.max_concurrency {
            let c = &mut config.congestion;
            c.max_concurrency = max;
            c.initial_concurrency = c.initial_concurrency.min(max);
            c.min_concurrency = c.min_concurrency.min(max);
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        config.validate()
    }
}
