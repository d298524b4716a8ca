//! Run configuration: the flag surface, its validated `Setup` form, and
//! the `code:value` custom-option grammar.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};

use crate::netio::frame::{VlanStack, VlanTag};

pub const BBF_ENTERPRISE_NUMBER: u32 = 3561;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Dora,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum V6ModeArg {
    Auto,
    Solicit,
    Relay,
}

/// Resolved DHCPv6 exchange mode; `auto` from the command line never
/// survives validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum V6Mode {
    Solicit,
    RelayForward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    Afpkt,
    Xdp,
}

#[derive(Debug, Clone)]
pub struct FlappingConf {
    pub flap_num: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub stay_down: Duration,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dhcperf", version, about = "DHCPv4/DHCPv6 load generator over raw Ethernet")]
pub struct Cli {
    /// interface name
    #[arg(short = 'i', long)]
    pub iface: String,
    /// number of clients
    #[arg(short = 'n', long, default_value_t = 1)]
    pub clients: usize,
    /// starting MAC address, defaults to the interface MAC
    #[arg(long)]
    pub mac: Option<MacAddress>,
    /// increment between two consecutive client MACs
    #[arg(long, default_value_t = 1)]
    pub macstep: u64,
    /// inner (or only) VLAN tag ID
    #[arg(long)]
    pub vlan: Option<u16>,
    /// outer VLAN tag ID for QinQ
    #[arg(long)]
    pub svlan: Option<u16>,
    /// EtherType for the VLAN tags, hex
    #[arg(long, value_parser = parse_hex_u16, default_value = "8100")]
    pub vlanetype: u16,
    /// increment between two consecutive clients' VLAN IDs
    #[arg(long, default_value_t = 1)]
    pub vlanstep: u16,
    /// VLAN IDs never assigned to a client
    #[arg(long, value_delimiter = ',')]
    pub excludedvlans: Vec<u16>,
    /// milliseconds between session launches
    #[arg(long, default_value_t = 1000)]
    pub interval: u64,
    /// forwarding engine
    #[arg(long = "eng", value_enum, default_value_t = DriverKind::Afpkt)]
    pub driver: DriverKind,

    /// do DHCPv4
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub v4: bool,
    /// do DHCPv6
    #[arg(long, default_value_t = false)]
    pub v6: bool,
    /// DHCPv6 exchange type
    #[arg(long = "v6m", value_enum, default_value_t = V6ModeArg::Auto)]
    pub v6_mode: V6ModeArg,
    /// request an IA_NA
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub iana: bool,
    /// request an IA_PD
    #[arg(long, default_value_t = false)]
    pub iapd: bool,
    /// send a Router Solicitation and require the managed flag first
    #[arg(long = "sendrs", default_value_t = false)]
    pub send_rs_first: bool,
    /// number of retries per exchange
    #[arg(long, default_value_t = 1)]
    pub retry: usize,
    /// per-exchange timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout: u64,

    /// BBF circuit-id template, @ID expands to the client index
    #[arg(long)]
    pub cid: Option<String>,
    /// BBF remote-id template, @ID expands to the client index
    #[arg(long)]
    pub rid: Option<String>,
    /// client-id template, @ID expands to the client index
    #[arg(long)]
    pub clntid: Option<String>,
    /// vendor class
    #[arg(long = "vc")]
    pub vendor_class: Option<String>,
    /// custom DHCPv4 option, code:value
    #[arg(long)]
    pub customv4option: Option<String>,
    /// custom DHCPv6 option, code:value
    #[arg(long)]
    pub customv6option: Option<String>,

    #[arg(long, value_enum, default_value_t = Action::Dora)]
    pub action: Action,
    /// persist acquired leases to the lease file
    #[arg(long, default_value_t = false)]
    pub savelease: bool,
    /// apply assigned addresses on the interface
    #[arg(short = 'a', long, default_value_t = false)]
    pub apply: bool,
    #[arg(long, default_value = "dhcperf.lease")]
    pub leasefile: PathBuf,
    /// ms between v4 and v6 setup; positive dials v4 first, negative v6 first
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub stackdelay: i64,

    /// number of flapping clients
    #[arg(long = "flap", default_value_t = 0)]
    pub flap_num: usize,
    /// minimal flapping interval, ms
    #[arg(long = "minflapint", default_value_t = 5000)]
    pub min_flap_interval: u64,
    /// max flapping interval, ms
    #[arg(long = "maxflapint", default_value_t = 30000)]
    pub max_flap_interval: u64,
    /// how long a flapped client stays down, ms
    #[arg(long = "flapstaydown", default_value_t = 10000)]
    pub flap_stay_down: u64,

    /// enable debug output
    #[arg(short = 'd', long, default_value_t = false)]
    pub debug: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("not a hex EtherType: {e}"))
}

/// `code:value` with a decimal code and the raw value bytes after the
/// first colon.
pub fn parse_custom_option(s: &str) -> Result<(u16, Vec<u8>)> {
    let (code, value) = s
        .split_once(':')
        .with_context(|| format!("invalid custom option {s:?}, expected code:value"))?;
    let code: u16 = code
        .parse()
        .with_context(|| format!("{code:?} is not an option code"))?;
    Ok((code, value.as_bytes().to_vec()))
}

/// Immutable run configuration, validated. Built once in `main`, shared
/// read-only by every task after that.
#[derive(Debug, Clone)]
pub struct Setup {
    pub ifname: String,
    pub num_of_clients: usize,
    pub start_mac: MacAddress,
    pub mac_step: u64,
    pub start_vlans: VlanStack,
    pub vlan_step: u16,
    pub excluded_vlans: Vec<u16>,
    pub interval: Duration,
    pub retry: usize,
    pub timeout: Duration,
    pub enable_v4: bool,
    pub enable_v6: bool,
    pub v6_mode: V6Mode,
    pub need_na: bool,
    pub need_pd: bool,
    pub send_rs_first: bool,
    pub apply_lease: bool,
    pub save_lease: bool,
    pub lease_file: PathBuf,
    pub action: Action,
    pub stack_delay_ms: i64,
    pub flapping: FlappingConf,
    pub rid: Option<String>,
    pub cid: Option<String>,
    pub clnt_id: Option<String>,
    pub vendor_class: Option<String>,
    pub custom_v4_option: Option<(u8, Vec<u8>)>,
    pub custom_v6_option: Option<(u16, Vec<u8>)>,
    pub debug: bool,
}

impl Setup {
    /// Validates the flag surface. `iface_mac` is the interface's own MAC,
    /// resolved by the caller, used when no starting MAC was given.
    pub fn from_cli(cli: Cli, iface_mac: Option<MacAddress>) -> Result<Self> {
        if cli.iface.is_empty() {
            bail!("interface name can't be empty");
        }
        if cli.clients == 0 {
            bail!("number of clients can't be zero");
        }
        if !cli.v4 && !cli.v6 {
            bail!("both DHCPv4 and DHCPv6 are disabled");
        }
        if cli.v6 && !cli.iana && !cli.iapd {
            bail!("DHCPv6 needs at least one of IA_NA or IA_PD");
        }
        for vid in &cli.excludedvlans {
            if *vid > 4095 {
                bail!("{vid} is not a valid VLAN ID");
            }
        }
        if cli.flap_num > cli.clients {
            bail!(
                "flapping number {} can't be bigger than client number {}",
                cli.flap_num,
                cli.clients
            );
        }
        if cli.min_flap_interval > cli.max_flap_interval {
            bail!(
                "minimal flapping interval {}ms is bigger than max value {}ms",
                cli.min_flap_interval,
                cli.max_flap_interval
            );
        }
        if cli.driver == DriverKind::Xdp {
            bail!("the xdp engine is not built into this binary, use afpkt");
        }

        let start_mac = match cli.mac {
            Some(mac) => mac,
            None => iface_mac
                .with_context(|| format!("can't read the MAC of interface {}", cli.iface))?,
        };

        if cli.svlan.is_some() && cli.vlan.is_none() {
            bail!("an outer VLAN (svlan) needs an inner VLAN (vlan) too");
        }
        // the configured EtherType applies to every tag, including
        // manually supplied ones
        let mut start_vlans = VlanStack::new();
        if let Some(svlan) = cli.svlan {
            start_vlans.push(VlanTag {
                id: svlan,
                ethertype: cli.vlanetype,
            });
        }
        if let Some(vlan) = cli.vlan {
            start_vlans.push(VlanTag {
                id: vlan,
                ethertype: cli.vlanetype,
            });
        }
        for tag in &start_vlans {
            if tag.id > 4095 {
                bail!("{} is not a valid VLAN ID", tag.id);
            }
        }

        let v6_mode = match cli.v6_mode {
            V6ModeArg::Solicit => V6Mode::Solicit,
            V6ModeArg::Relay => V6Mode::RelayForward,
            V6ModeArg::Auto => {
                if cli.rid.is_some() || cli.cid.is_some() {
                    V6Mode::RelayForward
                } else {
                    V6Mode::Solicit
                }
            }
        };

        let custom_v4_option = cli
            .customv4option
            .as_deref()
            .map(parse_custom_option)
            .transpose()?
            .map(|(code, value)| {
                if code > u16::from(u8::MAX) {
                    bail!("{code} is not a DHCPv4 option code");
                }
                Ok((code as u8, value))
            })
            .transpose()?;
        let custom_v6_option = cli
            .customv6option
            .as_deref()
            .map(parse_custom_option)
            .transpose()?;

        Ok(Setup {
            ifname: cli.iface,
            num_of_clients: cli.clients,
            start_mac,
            mac_step: cli.macstep,
            start_vlans,
            vlan_step: cli.vlanstep,
            excluded_vlans: cli.excludedvlans,
            interval: Duration::from_millis(cli.interval),
            retry: cli.retry,
            timeout: Duration::from_millis(cli.timeout),
            enable_v4: cli.v4,
            enable_v6: cli.v6,
            v6_mode,
            need_na: cli.iana,
            need_pd: cli.iapd,
            send_rs_first: cli.send_rs_first,
            apply_lease: cli.apply,
            save_lease: cli.savelease,
            lease_file: cli.leasefile,
            action: cli.action,
            stack_delay_ms: cli.stackdelay,
            flapping: FlappingConf {
                flap_num: cli.flap_num,
                min_interval: Duration::from_millis(cli.min_flap_interval),
                max_interval: Duration::from_millis(cli.max_flap_interval),
                stay_down: Duration::from_millis(cli.flap_stay_down),
            },
            rid: cli.rid,
            cid: cli.cid,
            clnt_id: cli.clntid,
            vendor_class: cli.vendor_class,
            custom_v4_option,
            custom_v6_option,
            debug: cli.debug,
        })
    }

    pub fn v4_first(&self) -> bool {
        self.stack_delay_ms >= 0
    }

    pub fn stack_delay(&self) -> Duration {
        Duration::from_millis(self.stack_delay_ms.unsigned_abs())
    }

    /// "At least one attempt": a retry count of 0 still dials once.
    pub fn attempts(&self) -> usize {
        self.retry.max(1)
    }
}
