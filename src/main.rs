use std::process::ExitCode;
use clap::Parser;

use testnet_wallet::{
    cli::{parse_network, CliArgs, Command, FiatAction, SeedAction},
    config::WalletConfig,
    error::AppError,
    explorer::EsploraClient,
    fiat_server,
    keys::KeyDeriver,
    store::SeedStore,
    wallet::Wallet,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("処理に失敗しました: {:?}", e);
            eprintln!("エラー: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。コマンド: {:?}", args.command);

    let file_config = match &args.config {
        Some(path) => WalletConfig::load(path)?,
        None => WalletConfig::default(),
    };
    let config = args.merge_into(file_config);
    log::debug!("設定: {:?}", config);

    if let Command::Fiat { action: FiatAction::Serve { bind } } = &args.command {
        let bind = bind.clone().unwrap_or_else(|| config.fiat_bind.clone());
        return tokio::task::spawn_blocking(move || fiat_server::serve(&bind))
            .await
            .map_err(|e| AppError::Internal(format!("サーバスレッドが異常終了しました: {}", e)))?;
    }

    let network = parse_network(&config.network)?;
    log::info!("指定されたネットワーク: {:?}", network);

    let mut store = SeedStore::open(&config.store_path)?;
    if let Command::Seed { action } = &args.command {
        let mnemonic = match action {
            SeedAction::Show => store.load_or_create_mnemonic()?,
            SeedAction::New => store.replace_mnemonic()?,
        };
        println!("{}", mnemonic);
        return Ok(());
    }

    let mnemonic = store.load_or_create_mnemonic()?;
    let deriver = KeyDeriver::from_mnemonic(&mnemonic, network)?;
    let explorer = EsploraClient::new(&config.explorer_url, config.request_timeout())?;
    let mut wallet = Wallet::new(deriver, store.load_session()?, config.lookahead, explorer);

    match &args.command {
        Command::Address { new } => {
            let key = if *new { wallet.new_receive_address()? } else { wallet.receive_address()? };
            if *new {
                store.save_session(&wallet.session())?;
            }
            println!("{}", key.address);
            println!("Path: {}", key.derivation_path);
        }
        Command::Balance => {
            let balance = wallet.refresh().await?;
            for output in &balance.outputs {
                println!("{} {} sats", output.out_point, output.value.to_sat());
            }
            println!("Balance: {} sats", balance.total.to_sat());
        }
        Command::Send { to, amount, fee_rate } => {
            let report = wallet.send(to, amount, *fee_rate).await?;
            store.save_session(&wallet.session())?;
            log::info!("インデックスを保存しました: {:?}", wallet.session());
            println!("Sent {}", report.txid);
            println!("Fee: {} sats", report.fee.to_sat());
            if let Some(change) = report.change {
                println!("Change: {} sats", change.to_sat());
            }
        }
        Command::Seed { .. } | Command::Fiat { .. } => {}
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}
