//! Session-level tests: identification, device operations and passthrough.

mod common;

use common::SimulatedRga;
use rga_core::{RgaConfig, RgaError};
use rga_driver::{MaxMass, Rga, ScanSettings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

async fn session(sim: SimulatedRga) -> anyhow::Result<(Rga, common::Simulation)> {
    let (transport, simulation) = sim.spawn();
    let rga = Rga::from_transport(transport, ScanSettings::default()).await?;
    Ok((rga, simulation))
}

#[tokio::test]
async fn test_identity_is_parsed_on_connect() -> anyhow::Result<()> {
    let (rga, _sim) = session(SimulatedRga::default()).await?;

    let identity = rga.identity();
    assert_eq!(identity.id_string, "SRSRGA200VER0.24SN19281");
    assert_eq!(identity.model_name, "SRSRGA200");
    assert_eq!(identity.firmware_version, "0.24");
    assert_eq!(identity.serial_number, "19281");
    assert_eq!(rga.max_mass(), MaxMass::Rga200);
    assert_eq!(rga.scan.final_mass_command().max, 200.0);
    Ok(())
}

#[tokio::test]
async fn test_unknown_mass_field_falls_back_to_rga100() -> anyhow::Result<()> {
    let sim = SimulatedRga::default().with_value("ID", "SRSRGA???VER0.24SN00001");
    let (rga, _sim) = session(sim).await?;

    assert_eq!(rga.max_mass(), MaxMass::Rga100);
    assert_eq!(rga.scan.final_mass_command().max, 100.0);
    Ok(())
}

#[tokio::test]
async fn test_foreign_instrument_is_rejected() -> anyhow::Result<()> {
    let sim = SimulatedRga::default()
        .with_value("ID", "Stanford_Research_Systems,SR830,s/n1,ver1.07");
    let (transport, _sim) = sim.spawn();

    let result = Rga::from_transport(transport, ScanSettings::default()).await;
    assert!(matches!(result, Err(RgaError::Identification(_))));
    Ok(())
}

#[tokio::test]
async fn test_reset_and_calibration() -> anyhow::Result<()> {
    let (rga, sim) = session(SimulatedRga::default()).await?;

    assert_eq!(rga.reset().await?, 0);
    assert_eq!(rga.calibrate_all().await?, 0);
    assert_eq!(rga.calibrate_electrometer().await?, 0);
    assert_eq!(sim.commands(), vec!["ID?", "IN2", "CA", "CL"]);
    Ok(())
}

#[tokio::test]
async fn test_status_summary() -> anyhow::Result<()> {
    let (rga, _sim) = session(SimulatedRga::default()).await?;
    assert_eq!(
        rga.status_summary().await?,
        "Emission current: 0.00 mA\nCEM HV: 0 V\nNo Error"
    );

    let sim = SimulatedRga::default()
        .with_value("FL", "1.00")
        .with_value("ER", "8")
        .with_value("EM", "128");
    let (rga, _sim) = session(sim).await?;
    assert_eq!(
        rga.status_summary().await?,
        "Emission current: 1.00 mA\nCEM HV: 0 V\nNo Electron Multiplier Option installed"
    );
    Ok(())
}

#[tokio::test]
async fn test_handle_command_routes_by_mnemonic() -> anyhow::Result<()> {
    let (rga, _sim) = session(SimulatedRga::default()).await?;

    assert_eq!(rga.handle_command("id?").await?, "SRSRGA200VER0.24SN19281");
    assert_eq!(rga.handle_command("ee80").await?, "0");
    assert_eq!(rga.handle_command("EE?").await?, "80");
    assert_eq!(rga.handle_command("tp?").await?, "1000");
    assert_eq!(rga.handle_command("mr28").await?, "2800");
    assert_eq!(rga.handle_command("mi5").await?, "");
    assert_eq!(rga.handle_command("MI?").await?, "5");
    assert_eq!(rga.handle_command("HS1").await?, "Scan Completed");
    assert_eq!(rga.scan.spectrum().await.len(), 61);
    assert!(matches!(
        rga.handle_command("MRxx").await,
        Err(RgaError::InvalidParameter(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_pressure_in_torr() -> anyhow::Result<()> {
    let (rga, _sim) = session(SimulatedRga::default()).await?;

    // ST 0.05 mA/Torr, CEM off, TP reading 1000.
    let torr = rga.total_pressure_in_torr().await?;
    assert!((torr - 1000.0 * 1e-13 / 0.05).abs() < 1e-20);

    rga.scan.histogram_scan().await?;
    let partial = rga.partial_pressure_spectrum().await?;
    assert_eq!(partial.len(), 65);
    assert!((partial[10] - 10.0 * 1e-13 / 0.1).abs() < 1e-22);
    Ok(())
}

#[tokio::test]
async fn test_connect_over_tcp_logs_in_and_identifies() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let adapter = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut received = Vec::new();
        loop {
            let mut line = Vec::new();
            if socket.read_until(b'\r', &mut line).await.unwrap() == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&line).trim().to_string();
            let reply: &[u8] = match received.len() {
                0 => b"",
                1 => b"Login Successful\n\r",
                _ if line == "ID?" => b"SRSRGA300VER0.24SN11111\n\r",
                _ => b"",
            };
            received.push(line);
            socket.get_mut().write_all(reply).await.unwrap();
        }
        received
    });

    let config = RgaConfig::from_toml_str(&format!(
        r#"
        [connection]
        type = "tcp"
        host = "127.0.0.1"
        port = {}
        user_id = "operator"
        password = "secret"
        "#,
        port
    ))?;
    let rga = Rga::connect(&config).await?;
    assert_eq!(rga.max_mass(), MaxMass::Rga300);
    assert_eq!(rga.identity().serial_number, "11111");
    drop(rga);

    assert_eq!(adapter.await?, vec!["operator", "secret", "ID?"]);
    Ok(())
}
