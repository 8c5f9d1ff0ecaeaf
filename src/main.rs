use odata_client::{ClientConfig, ClientModel, DataServiceContext, DataServiceRequest, OperationResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: odata-batch <query-path>...");
        eprintln!("  e.g. odata-batch 'Customers?$top=5' 'Orders/$count'");
        std::process::exit(2);
    }

    let config = ClientConfig::load()?;
    println!("Service root: {}", config.service.root);

    let context = DataServiceContext::from_config(&config, ClientModel::new())?;
    // Entries of unregistered types are reported but not tracked.
    context.set_merge_option(odata_client::MergeOption::NoTracking);

    let queries = paths.iter().map(DataServiceRequest::new).collect();
    let response = context.execute_batch(queries).await?;

    println!(
        "$batch returned {}",
        response
            .batch_status_code
            .map(|s| s.to_string())
            .unwrap_or_else(|| "nothing".to_string())
    );
    for (path, operation) in paths.iter().zip(response.iter()) {
        match operation {
            OperationResponse::Query(query) => match &query.error {
                Some(error) => println!("  {} {} -> {}", query.status_code, path, error),
                None => println!(
                    "  {} {} -> {} entr{}{}",
                    query.status_code,
                    path,
                    query.entries.len(),
                    if query.entries.len() == 1 { "y" } else { "ies" },
                    query
                        .count
                        .map(|c| format!(" (count {})", c))
                        .unwrap_or_default()
                ),
            },
            OperationResponse::Change(change) => println!("  {} {}", change.status_code, path),
        }
    }

    Ok(())
}
