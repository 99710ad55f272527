use droidcore::{
    cvd::{parse_group_number, Fleet, FleetStatus},
    health::{classify, ToolchainSignal, Verdict},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const FLEET_OUTPUT: &str = r#"fetching fleet status from the server
{
  "groups": [
    {
      "group_name": "cvd_1",
      "instances": [
        { "adb_port": 6520, "adb_serial": "0.0.0.0:6520", "instance_name": "1", "status": "Running", "webrtc_device_id": "cvd-1" }
      ]
    },
    {
      "group_name": "cvd_3",
      "instances": [
        { "adb_port": 6522, "instance_name": "3", "status": "Stopped" }
      ]
    },
    {
      "group_name": "cvd_4",
      "instances": [
        { "adb_port": 6523, "instance_name": "4", "status": "Cancelled" }
      ]
    },
    {
      "group_name": "scratch",
      "instances": []
    }
  ]
}
trailing diagnostics
"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_fleet_status_drives_health_verdicts() -> anyhow::Result<()> {
    let fleet = Fleet::parse(FLEET_OUTPUT);
    assert_eq!(fleet.groups.len(), 4);

    let numbers = fleet.instance_numbers();
    assert_eq!(numbers.keys().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
    assert_eq!(numbers[&3], "cvd_3");

    let table = fleet.status_table();
    assert_eq!(table[&1], FleetStatus::Running);
    assert_eq!(table[&3], FleetStatus::Stopped);
    assert_eq!(table[&4], FleetStatus::Other("Cancelled".to_string()));

    // Trusted statuses decide alone, whatever the probes say.
    assert_eq!(
        classify(ToolchainSignal::from(table.get(&1)), Some(false), Some(false)),
        Verdict::Running {
            reset_failures: true
        }
    );
    assert_eq!(
        classify(ToolchainSignal::from(table.get(&3)), Some(true), Some(true)),
        Verdict::Stopped
    );

    // A cancelled or unlisted instance falls through to the direct probes.
    let cancelled = ToolchainSignal::from(table.get(&4));
    assert!(cancelled.is_ambiguous());
    assert!(ToolchainSignal::from(table.get(&9)).is_ambiguous());

    assert_eq!(
        classify(cancelled, Some(true), None),
        Verdict::Running {
            reset_failures: true
        }
    );
    assert_eq!(
        classify(cancelled, Some(false), Some(true)),
        Verdict::Running {
            reset_failures: false
        }
    );
    assert_eq!(classify(cancelled, Some(false), Some(false)), Verdict::Stopped);
    assert_eq!(classify(cancelled, None, None), Verdict::Stopped);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_fleet_text_fallback_keeps_group_numbers() -> anyhow::Result<()> {
    let fleet = Fleet::parse("cvd_2 (running)\ncvd_7 (stopped)\ncvd_2 again\nno json here");
    assert_eq!(
        fleet.instance_numbers().into_iter().collect::<Vec<_>>(),
        vec![(2, "cvd_2".to_string()), (7, "cvd_7".to_string())]
    );

    // Text output carries no per-instance status, so every group is ambiguous.
    let table = fleet.status_table();
    assert!(table
        .values()
        .all(|status| matches!(status, FleetStatus::Other(_))));
    assert!(ToolchainSignal::from(table.get(&2)).is_ambiguous());

    assert!(Fleet::parse("").groups.is_empty());
    assert_eq!(parse_group_number("cvd_12"), Some(12));
    assert_eq!(parse_group_number("group"), None);
    assert_eq!(FleetStatus::from_toolchain(" RUNNING "), FleetStatus::Running);

    Ok(())
}
