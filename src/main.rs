use clap::Parser;
use csfle_workflow::{
    config::{WorkflowConfig, DEFAULT_CONFIG_FILE_PATH},
    log,
    mongodb::bson::DateTime,
    payload::{Address, EmployeeRecord, PersonName},
    Workflow,
};
use tracing::{error, info};

///
/// Inserts one employee record into MongoDB with client-side field level encryption.
///
/// Connection, key vault, KMS and crypt_shared settings are read from the configuration file and
/// from CSFLE_-prefixed environment variables, e.g. CSFLE_CONNECTION__PASSWORD.
///
#[derive(Debug, Parser)]
#[command(version, about, verbatim_doc_comment)]
struct Args {
    /// Path of the configuration file.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_FILE_PATH)]
    config: String,

    #[arg(long, default_value = "Magnus")]
    first_name: String,

    #[arg(long, default_value = "Stråle")]
    last_name: String,

    /// Omitted from the stored record when not given.
    #[arg(long)]
    other_names: Option<String>,

    /// Date of birth, RFC 3339.
    #[arg(long, default_value = "1999-01-12T00:00:00Z", value_parser = parse_date)]
    dob: DateTime,

    /// Read the record back after inserting it and check what was stored.
    #[arg(long, default_value_t = false)]
    verify: bool,

    /// Overrides the configured log level.
    #[arg(short, long, env = "CSFLE_LOG__LEVEL")]
    log_level: Option<String>,
}

fn parse_date(s: &str) -> Result<DateTime, String> {
    DateTime::parse_rfc3339_str(s).map_err(|e| e.to_string())
}

impl Args {
    fn record(&self) -> EmployeeRecord {
        let name = match &self.other_names {
            Some(other_names) => PersonName::builder()
                .first_name(self.first_name.as_str())
                .last_name(self.last_name.as_str())
                .other_names(other_names.as_str())
                .build(),
            None => PersonName::builder()
                .first_name(self.first_name.as_str())
                .last_name(self.last_name.as_str())
                .build(),
        };

        EmployeeRecord::builder()
            .name(name)
            .address(
                Address::builder()
                    .street_address("29 Bson Street")
                    .suburb_county("Mongoville")
                    .state_province("Victoria")
                    .zip_postcode("3999")
                    .country("Oz")
                    .build(),
            )
            .dob(self.dob)
            .phone_number("1800MONGO")
            .salary(999999.99)
            .tax_identifier("78SDSSWN001")
            .role(vec!["Student".to_string()])
            .build()
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match WorkflowConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {}", err.diagnostic(), err);
            std::process::exit(err.class().exit_code());
        }
    };
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }

    log::init(&config.log);

    let record = args.record();
    match Workflow::new(config).verify(args.verify).run(&record).await {
        Ok(report) => {
            if let Some(verification) = &report.verification {
                info!(
                    ciphertext = ?verification.ciphertext_paths,
                    absent = ?verification.absent_paths,
                    "verification passed"
                );
            }
            println!("{}", report.inserted_id_string());
        }
        Err(err) => {
            error!(class = %err.class(), error = %err, "{}", err.diagnostic());
            eprintln!("{}: {}", err.diagnostic(), err);
            std::process::exit(err.class().exit_code());
        }
    }
}
