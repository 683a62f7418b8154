//! Pretty-printer over the daemon's published state.

use anyhow::{Context, Result};
use rbmc_common::bus::BusClient;
use rbmc_common::ipc::property;
use rbmc_common::paths;
use rbmc_common::store::{key, Store};
use rbmc_common::types::{BMCState, Role};
use rbmc_common::version;
use std::collections::BTreeMap;

pub async fn display_local_bmc_info(extended: bool) -> Result<()> {
    let mut client = BusClient::connect(paths::RBMCD_SOCKET)
        .await
        .context("connecting to rbmcd; is it running?")?;
    let props = client.get_properties().await?;

    println!("Local BMC");
    println!("-----------------------------");

    let role = props
        .get(property::ROLE)
        .and_then(|v| serde_json::from_value::<Role>(v.clone()).ok())
        .unwrap_or(Role::Unknown);
    println!("Role:                {role}");

    match rbmc_common::platform::read_bmc_position() {
        Ok(position) => println!("BMC Position:        {position}"),
        Err(e) => println!("BMC Position:        {e}"),
    }

    let redundancy_enabled = props
        .get(property::REDUNDANCY_ENABLED)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    println!("Redundancy Enabled:  {redundancy_enabled}");

    if !extended {
        return Ok(());
    }

    println!("BMC State:           {}", local_bmc_state().await);

    let failovers_allowed = props
        .get(property::FAILOVERS_ALLOWED)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    println!("Failovers Allowed:   {failovers_allowed}");

    println!("FW version hash:     {}", version::fw_version_digest());

    let store = Store::new();

    if role != Role::Unknown {
        let reason = store
            .read::<String>(key::ROLE_REASON)
            .unwrap_or_else(|| "No reason found".to_string());
        println!("Role Reason:         {reason}");
    }

    if role == Role::Active && !redundancy_enabled {
        print_no_redundancy_reasons(&store);
    }

    if role == Role::Active && redundancy_enabled && !failovers_allowed {
        print_failovers_paused_reasons(&store);
    }

    Ok(())
}

async fn local_bmc_state() -> String {
    let result = async {
        let mut client = BusClient::connect(paths::BMC_STATE_SOCKET).await?;
        let props = client.get_properties().await?;
        let value = props
            .get(property::CURRENT_BMC_STATE)
            .context("CurrentBMCState not published")?;
        serde_json::from_value::<BMCState>(value.clone()).context("parsing CurrentBMCState")
    }
    .await;

    match result {
        Ok(state) => state.to_string(),
        // Just show the error in the state field.
        Err(e) => e.to_string(),
    }
}

fn print_no_redundancy_reasons(store: &Store) {
    println!("Reasons for no BMC redundancy:");

    let details = store
        .read::<BTreeMap<u8, String>>(key::NO_RED_DETAILS)
        .unwrap_or_default();

    if details.is_empty() {
        // The active BMC can spend a long time waiting on the passive one
        // before redundancy can even be checked.
        println!("    In transition");
    } else {
        for description in details.values() {
            println!("    {description}");
        }
    }
}

fn print_failovers_paused_reasons(store: &Store) {
    println!("Reasons failovers are paused:");

    let reasons = store
        .read::<Vec<String>>(key::FAILOVERS_PAUSED_REASONS)
        .unwrap_or_default();

    if reasons.is_empty() {
        println!("    Unknown");
    } else {
        for reason in reasons {
            println!("    {reason}");
        }
    }
}
