use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tagger::conll::{self, Sentence, Vocabularies};
use tagger::{EmbeddingTable, SequenceTagger, TaggerConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "tagger")]
#[command(about = "Train a neural sequence labeller on CoNLL data")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the architecture and parameter counts for a configuration
    Summary {
        /// JSON configuration file; defaults are used when omitted
        #[arg(long)]
        config: Option<String>,
    },
    /// Train on a CoNLL file
    Train {
        #[arg(long)]
        config: Option<String>,
        /// Training corpus (`word pos chunk tag` per line)
        #[arg(long)]
        train: String,
        /// Optional development corpus evaluated after every epoch
        #[arg(long)]
        dev: Option<String>,
        /// Whitespace-separated pretrained word vectors
        #[arg(long)]
        embeddings: Option<String>,
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Versioned checkpoint written after training (`.json` or binary)
        #[arg(long)]
        save: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> tagger::Result<TaggerConfig> {
    match path {
        Some(path) => TaggerConfig::from_json_file(path),
        None => Ok(TaggerConfig::default()),
    }
}

fn print_summary(tagger: &SequenceTagger) {
    let config = tagger.config();
    println!("\n=== MODEL INFORMATION ===");
    println!("Network architecture: {}", tagger.architecture());
    println!(
        "Input features: word {} + char {} + pos {} + aux {} = {}",
        config.word_dim,
        config.char_feature_dim(),
        config.pos_dim,
        config.aux_dim,
        config.input_dim()
    );
    println!("Encoder output: {}", config.encoder_dim());
    println!("Trainable parameters: {}", tagger.trainable_parameters());
    println!("Total parameters: {}", tagger.total_parameters());
}

fn train(
    mut config: TaggerConfig,
    train_path: &str,
    dev_path: Option<&str>,
    embeddings: Option<&str>,
    epochs: usize,
    batch_size: usize,
    save: Option<&str>,
) -> tagger::Result<()> {
    let mut train_set = conll::read_conll(train_path)?;
    let dev_set = dev_path.map(conll::read_conll).transpose()?;
    let vocabs = Vocabularies::build(&train_set);

    config.word_vocab_size = vocabs.words.size();
    config.char_vocab_size = vocabs.chars.size();
    config.pos_vocab_size = vocabs.pos.size();
    config.aux_dim = vocabs.aux_dim();
    config.class_count = vocabs.class_count();

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    let word_table = match embeddings {
        Some(path) => conll::load_word_vectors(path, &vocabs.words, config.word_dim)?,
        None => EmbeddingTable::random_uniform(config.word_vocab_size, config.word_dim, -0.5, 0.5, &mut rng)
            .weights()
            .clone(),
    };

    let mut tagger = SequenceTagger::new(config.clone(), word_table)?;
    print_summary(&tagger);

    let encode = |sentences: &[Sentence]| {
        conll::encode_batch(sentences, &vocabs, config.sentence_length, config.word_length)
    };
    let dev_batch = dev_set.as_deref().map(&encode).transpose()?;

    for epoch in 0..epochs {
        train_set.shuffle(&mut rng);
        let (mut total_loss, mut total_accuracy, mut steps) = (0.0, 0.0, 0);
        for chunk in train_set.chunks(batch_size.max(1)) {
            let report = tagger.train_step(&encode(chunk)?)?;
            total_loss += report.loss;
            total_accuracy += report.accuracy;
            steps += 1;
        }
        let steps = steps.max(1) as f32;
        info!(
            epoch,
            loss = total_loss / steps,
            accuracy = total_accuracy / steps,
            learning_rate = tagger.learning_rate(),
            global_step = tagger.global_step(),
            "Training epoch completed"
        );
        println!(
            "Epoch {}: Loss = {:.4}, Accuracy = {:.4}",
            epoch,
            total_loss / steps,
            total_accuracy / steps
        );

        if let Some(batch) = &dev_batch {
            let metrics = tagger.evaluate(batch)?;
            info!(epoch, loss = metrics.loss, accuracy = metrics.accuracy, "Development set evaluated");
            println!("  dev: Loss = {:.4}, Accuracy = {:.4}", metrics.loss, metrics.accuracy);
        }
    }

    if let Some(path) = save {
        tagger.save_versioned(path, Some(format!("trained on {train_path} for {epochs} epochs")))?;
    }
    Ok(())
}

fn main() -> tagger::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!(threads = rayon::current_num_threads(), "Compute pool ready");

    match args.command {
        Command::Summary { config } => {
            let config = load_config(config.as_deref())?;
            let word_table = ndarray::Array2::zeros((config.word_vocab_size, config.word_dim));
            let tagger = SequenceTagger::new(config, word_table)?;
            print_summary(&tagger);
        }
        Command::Train {
            config,
            train: train_path,
            dev,
            embeddings,
            epochs,
            batch_size,
            save,
        } => {
            let config = load_config(config.as_deref())?;
            train(
                config,
                &train_path,
                dev.as_deref(),
                embeddings.as_deref(),
                epochs,
                batch_size,
                save.as_deref(),
            )?;
        }
    }
    Ok(())
}
