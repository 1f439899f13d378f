use std::path::{Path, PathBuf};

use crate::config::BrickConfig;
use crate::error::{Error, Result};

use super::probe::random_mac;

/// Closed set of brick types. The factory constructs bricks keyed on this
/// enumeration; there is no runtime type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrickKind {
    Switch,
    SwitchWrapper,
    Tap,
    Capture,
    Wire,
    Wirefilter,
    TunnelConnect,
    TunnelListen,
    Qemu,
}

impl BrickKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "switch" => Some(Self::Switch),
            "switchwrapper" => Some(Self::SwitchWrapper),
            "tap" => Some(Self::Tap),
            "capture" => Some(Self::Capture),
            "wire" => Some(Self::Wire),
            "wirefilter" => Some(Self::Wirefilter),
            "tunnelconnect" | "tunnelc" => Some(Self::TunnelConnect),
            "tunnellisten" | "tunnell" => Some(Self::TunnelListen),
            "qemu" | "vm" => Some(Self::Qemu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switch => "Switch",
            Self::SwitchWrapper => "SwitchWrapper",
            Self::Tap => "Tap",
            Self::Capture => "Capture",
            Self::Wire => "Wire",
            Self::Wirefilter => "Wirefilter",
            Self::TunnelConnect => "TunnelConnect",
            Self::TunnelListen => "TunnelListen",
            Self::Qemu => "Qemu",
        }
    }

    /// True for kinds resolved through the QEMU tool directory rather than
    /// the VDE one.
    pub fn uses_qemu_tools(&self) -> bool {
        matches!(self, Self::Qemu)
    }

    /// Number of network plugs a freshly created brick of this kind carries.
    fn initial_plugs(&self) -> usize {
        match self {
            Self::Switch | Self::SwitchWrapper => 0,
            Self::Wire | Self::Wirefilter => 2,
            Self::Tap | Self::Capture | Self::TunnelConnect | Self::TunnelListen => 1,
            Self::Qemu => 0,
        }
    }
}

/// A named network attachment point, connected to at most one peer brick.
#[derive(Debug, Clone)]
pub struct Plug {
    pub name: String,
    pub peer: Option<String>,
    /// Generated NIC hardware address, present on QEMU plugs only.
    pub mac: Option<String>,
}

/// Everything the factory resolves before asking a brick for its command
/// line: the workspace for sockets, one socket path per connected plug, and
/// the VDE helpers wires are built from.
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub workspace: &'a Path,
    pub peer_sockets: Vec<PathBuf>,
    pub vde_plug: Option<PathBuf>,
    pub wirefilter: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Brick {
    name: String,
    kind: BrickKind,
    config: BrickConfig,
    plugs: Vec<Plug>,
}

impl Brick {
    pub fn new(name: impl Into<String>, kind: BrickKind) -> Self {
        let name = name.into();
        let plugs = (0..kind.initial_plugs())
            .map(|index| Plug {
                name: format!("port{index}"),
                peer: None,
                mac: None,
            })
            .collect();
        Self {
            name,
            kind,
            config: default_config(kind),
            plugs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn kind(&self) -> BrickKind {
        self.kind
    }

    pub fn config(&self) -> &BrickConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BrickConfig {
        &mut self.config
    }

    pub fn plugs(&self) -> &[Plug] {
        &self.plugs
    }

    /// Add a plug; QEMU plugs receive a generated MAC address.
    pub fn add_plug(&mut self) -> &Plug {
        let index = self.plugs.len();
        self.plugs.push(Plug {
            name: format!("port{index}"),
            peer: None,
            mac: (self.kind == BrickKind::Qemu).then(random_mac),
        });
        &self.plugs[index]
    }

    pub fn connect_plug(&mut self, index: usize, peer: String) -> Result<()> {
        let name = self.name.clone();
        let plug = self.plug_mut(index)?;
        if plug.peer.is_some() {
            return Err(Error::LinkInUse {
                brick: name,
                plug: plug.name.clone(),
            });
        }
        plug.peer = Some(peer);
        Ok(())
    }

    pub fn disconnect_plug(&mut self, index: usize) -> Result<()> {
        self.plug_mut(index)?.peer = None;
        Ok(())
    }

    fn plug_mut(&mut self, index: usize) -> Result<&mut Plug> {
        let brick = self.name.clone();
        self.plugs.get_mut(index).ok_or_else(|| Error::BadConfig {
            brick,
            message: format!("no plug with index {index}"),
        })
    }

    /// Control socket this brick exposes (or wraps) for peers to attach to.
    pub fn socket_path(&self, workspace: &Path) -> Option<PathBuf> {
        match self.kind {
            BrickKind::Switch => Some(workspace.join(format!("{}.ctl", self.name))),
            BrickKind::SwitchWrapper => self.config.text("path").map(PathBuf::from),
            _ => None,
        }
    }

    /// Name of the binary this brick spawns, before path resolution.
    /// SwitchWrapper manages no process.
    pub fn binary_name(&self) -> Option<String> {
        match self.kind {
            BrickKind::Switch => Some("vde_switch".to_string()),
            BrickKind::SwitchWrapper => None,
            BrickKind::Tap => Some("vde_plug2tap".to_string()),
            BrickKind::Capture => Some("vde_pcapplug".to_string()),
            BrickKind::Wire | BrickKind::Wirefilter => Some("dpipe".to_string()),
            BrickKind::TunnelConnect | BrickKind::TunnelListen => {
                Some("vde_cryptcab".to_string())
            }
            BrickKind::Qemu => Some(
                self.config
                    .text("argv0")
                    .filter(|argv0| !argv0.is_empty())
                    .unwrap_or("qemu-system-x86_64")
                    .to_string(),
            ),
        }
    }

    /// Validate the configuration ahead of poweron.
    ///
    /// SwitchWrapper and Capture deliberately get only the minimal contract
    /// (a non-empty path/interface); their historical validation rules were
    /// never pinned down.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Error::BadConfig {
            brick: self.name.clone(),
            message,
        };

        match self.kind {
            BrickKind::Switch => {
                let ports = self.config.number("numports").unwrap_or(0);
                if !(1..=255).contains(&ports) {
                    return Err(fail(format!(
                        "`numports` must be between 1 and 255, got {ports}"
                    )));
                }
            }
            BrickKind::SwitchWrapper => {
                if self.config.text("path").unwrap_or("").is_empty() {
                    return Err(fail("`path` to the external switch socket is required".into()));
                }
            }
            BrickKind::Tap => {
                if self.config.text("name").unwrap_or("").is_empty() {
                    return Err(fail("`name` of the tap device is required".into()));
                }
            }
            BrickKind::Capture => {
                if self.config.text("iface").unwrap_or("").is_empty() {
                    return Err(fail("`iface` to capture from is required".into()));
                }
            }
            BrickKind::Wire | BrickKind::Wirefilter => {
                if self.plugs.iter().any(|plug| plug.peer.is_none()) {
                    return Err(fail("both ends of the wire must be connected".into()));
                }
            }
            BrickKind::TunnelConnect => {
                if self.config.text("host").unwrap_or("").is_empty() {
                    return Err(fail("`host` of the remote tunnel endpoint is required".into()));
                }
                let port = self.config.number("port").unwrap_or(0);
                if !(1..=65535).contains(&port) {
                    return Err(fail(format!("`port` must be a valid TCP port, got {port}")));
                }
            }
            BrickKind::TunnelListen => {
                let port = self.config.number("port").unwrap_or(0);
                if !(1..=65535).contains(&port) {
                    return Err(fail(format!("`port` must be a valid TCP port, got {port}")));
                }
            }
            BrickKind::Qemu => {
                let ram = self.config.number("ram").unwrap_or(0);
                if ram <= 0 {
                    return Err(fail(format!("`ram` must be positive MiB, got {ram}")));
                }
                let smp = self.config.number("smp").unwrap_or(0);
                if smp <= 0 {
                    return Err(fail(format!("`smp` must be a positive count, got {smp}")));
                }
            }
        }

        // Kinds that attach to a switch need their single plug wired up.
        if matches!(
            self.kind,
            BrickKind::Tap | BrickKind::Capture | BrickKind::TunnelConnect | BrickKind::TunnelListen
        ) && self.plugs.first().and_then(|plug| plug.peer.as_deref()).is_none()
        {
            return Err(Error::BadConfig {
                brick: self.name.clone(),
                message: "the brick's plug must be connected to a switch".into(),
            });
        }

        Ok(())
    }

    /// Assemble the argument vector for this brick's process.
    pub fn build_args(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>> {
        let sock_arg = |index: usize| -> Result<String> {
            ctx.peer_sockets
                .get(index)
                .map(|path| path.display().to_string())
                .ok_or_else(|| Error::BadConfig {
                    brick: self.name.clone(),
                    message: format!("plug {index} has no resolved peer socket"),
                })
        };

        match self.kind {
            BrickKind::Switch => {
                let sock = ctx.workspace.join(format!("{}.ctl", self.name));
                let mgmt = ctx.workspace.join(format!("{}.mgmt", self.name));
                let mut args = vec![
                    "-s".to_string(),
                    sock.display().to_string(),
                    "-M".to_string(),
                    mgmt.display().to_string(),
                    "-n".to_string(),
                    self.config.number("numports").unwrap_or(32).to_string(),
                ];
                if self.config.flag("hub") {
                    args.push("-x".to_string());
                }
                Ok(args)
            }
            BrickKind::SwitchWrapper => Err(Error::BadConfig {
                brick: self.name.clone(),
                message: "SwitchWrapper does not own a process".into(),
            }),
            BrickKind::Tap => Ok(vec![
                "-s".to_string(),
                sock_arg(0)?,
                self.config.text("name").unwrap_or_default().to_string(),
            ]),
            BrickKind::Capture => Ok(vec![
                "-s".to_string(),
                sock_arg(0)?,
                self.config.text("iface").unwrap_or_default().to_string(),
            ]),
            BrickKind::Wire => {
                let vde_plug = self.helper_path(ctx.vde_plug.as_deref(), "vde_plug")?;
                Ok(vec![
                    vde_plug.clone(),
                    sock_arg(0)?,
                    "=".to_string(),
                    vde_plug,
                    sock_arg(1)?,
                ])
            }
            BrickKind::Wirefilter => {
                let vde_plug = self.helper_path(ctx.vde_plug.as_deref(), "vde_plug")?;
                let wirefilter = self.helper_path(ctx.wirefilter.as_deref(), "wirefilter")?;
                let mut args = vec![vde_plug.clone(), sock_arg(0)?, "=".to_string(), wirefilter];
                if let Some(delay) = self.config.number("delay").filter(|d| *d > 0) {
                    args.push("-d".to_string());
                    args.push(delay.to_string());
                }
                if let Some(loss) = self.config.number("loss").filter(|l| *l > 0) {
                    args.push("-l".to_string());
                    args.push(loss.to_string());
                }
                args.push("=".to_string());
                args.push(vde_plug);
                args.push(sock_arg(1)?);
                Ok(args)
            }
            BrickKind::TunnelConnect => Ok(vec![
                "-p".to_string(),
                self.config.number("port").unwrap_or(7667).to_string(),
                "-c".to_string(),
                self.config.text("host").unwrap_or_default().to_string(),
                "-s".to_string(),
                sock_arg(0)?,
            ]),
            BrickKind::TunnelListen => Ok(vec![
                "-p".to_string(),
                self.config.number("port").unwrap_or(7667).to_string(),
                "-s".to_string(),
                sock_arg(0)?,
            ]),
            BrickKind::Qemu => {
                let mut args = vec![
                    "-name".to_string(),
                    self.name.clone(),
                    "-m".to_string(),
                    format!("{}M", self.config.number("ram").unwrap_or(256)),
                    "-smp".to_string(),
                    self.config.number("smp").unwrap_or(1).to_string(),
                    "-display".to_string(),
                    "none".to_string(),
                ];
                if let Some(hda) = self.config.text("hda").filter(|hda| !hda.is_empty()) {
                    args.push("-hda".to_string());
                    args.push(hda.to_string());
                }
                if self.config.flag("snapshot") {
                    args.push("-snapshot".to_string());
                }
                if self.config.flag("kvm") {
                    args.push("-enable-kvm".to_string());
                }
                let qmp = ctx.workspace.join(format!("{}.qmp", self.name));
                args.push("-qmp".to_string());
                args.push(format!("unix:{},server=on,wait=off", qmp.display()));
                // Socket list holds one entry per connected plug, in order.
                let connected = self.plugs.iter().filter(|plug| plug.peer.is_some());
                for (index, plug) in connected.enumerate() {
                    let mac = plug.mac.as_deref().unwrap_or("00:aa:00:00:00:00");
                    args.push("-net".to_string());
                    args.push(format!("nic,vlan={index},macaddr={mac}"));
                    args.push("-net".to_string());
                    args.push(format!("vde,vlan={index},sock={}", sock_arg(index)?));
                }
                Ok(args)
            }
        }
    }

    fn helper_path(&self, path: Option<&Path>, name: &str) -> Result<String> {
        path.map(|p| p.display().to_string())
            .ok_or_else(|| Error::BadConfig {
                brick: self.name.clone(),
                message: format!("`{name}` helper was not resolved"),
            })
    }
}

fn default_config(kind: BrickKind) -> BrickConfig {
    let mut config = BrickConfig::new();
    match kind {
        BrickKind::Switch => {
            config.set("numports", 32i64);
            config.set("hub", false);
        }
        BrickKind::SwitchWrapper => {
            config.set("path", "");
        }
        BrickKind::Tap => {
            config.set("name", "");
        }
        BrickKind::Capture => {
            config.set("iface", "");
        }
        BrickKind::Wire => {}
        BrickKind::Wirefilter => {
            config.set("delay", 0i64);
            config.set("loss", 0i64);
        }
        BrickKind::TunnelConnect => {
            config.set("host", "");
            config.set("port", 7667i64);
        }
        BrickKind::TunnelListen => {
            config.set("port", 7667i64);
        }
        BrickKind::Qemu => {
            config.set("argv0", "qemu-system-x86_64");
            config.set("ram", 256i64);
            config.set("smp", 1i64);
            config.set("hda", "");
            config.set("kvm", false);
            config.set("snapshot", false);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_is_case_insensitive_and_closed() {
        assert_eq!(BrickKind::parse("Switch"), Some(BrickKind::Switch));
        assert_eq!(BrickKind::parse("qemu"), Some(BrickKind::Qemu));
        assert_eq!(BrickKind::parse("tunnelc"), Some(BrickKind::TunnelConnect));
        assert_eq!(BrickKind::parse("plumbus"), None);
    }

    #[test]
    fn switch_defaults_validate() {
        let brick = Brick::new("sw0", BrickKind::Switch);
        brick.validate().unwrap();
        assert_eq!(brick.config().number("numports"), Some(32));
    }

    #[test]
    fn switch_rejects_out_of_range_port_count() {
        let mut brick = Brick::new("sw0", BrickKind::Switch);
        brick.config_mut().set("numports", 0i64);
        assert!(matches!(brick.validate(), Err(Error::BadConfig { .. })));
    }

    #[test]
    fn tap_requires_device_name_and_connected_plug() {
        let mut brick = Brick::new("tap0", BrickKind::Tap);
        assert!(matches!(brick.validate(), Err(Error::BadConfig { .. })));

        brick.config_mut().set("name", "tap0");
        assert!(matches!(brick.validate(), Err(Error::BadConfig { .. })));

        brick.connect_plug(0, "sw0".to_string()).unwrap();
        brick.validate().unwrap();
    }

    #[test]
    fn connecting_an_occupied_plug_is_rejected() {
        let mut brick = Brick::new("tap0", BrickKind::Tap);
        brick.connect_plug(0, "sw0".to_string()).unwrap();
        assert!(matches!(
            brick.connect_plug(0, "sw1".to_string()),
            Err(Error::LinkInUse { .. })
        ));
        brick.disconnect_plug(0).unwrap();
        brick.connect_plug(0, "sw1".to_string()).unwrap();
    }

    #[test]
    fn switch_args_carry_socket_and_port_count() {
        let mut brick = Brick::new("sw0", BrickKind::Switch);
        brick.config_mut().set("hub", true);
        let ctx = CommandContext {
            workspace: Path::new("/run/brickyard"),
            peer_sockets: Vec::new(),
            vde_plug: None,
            wirefilter: None,
        };
        let args = brick.build_args(&ctx).unwrap();
        assert_eq!(
            args,
            vec![
                "-s",
                "/run/brickyard/sw0.ctl",
                "-M",
                "/run/brickyard/sw0.mgmt",
                "-n",
                "32",
                "-x",
            ]
        );
    }

    #[test]
    fn wire_args_form_a_dpipe_pipeline() {
        let mut brick = Brick::new("w0", BrickKind::Wire);
        brick.connect_plug(0, "sw0".to_string()).unwrap();
        brick.connect_plug(1, "sw1".to_string()).unwrap();
        let ctx = CommandContext {
            workspace: Path::new("/run/brickyard"),
            peer_sockets: vec![
                PathBuf::from("/run/brickyard/sw0.ctl"),
                PathBuf::from("/run/brickyard/sw1.ctl"),
            ],
            vde_plug: Some(PathBuf::from("/usr/bin/vde_plug")),
            wirefilter: None,
        };
        let args = brick.build_args(&ctx).unwrap();
        assert_eq!(
            args,
            vec![
                "/usr/bin/vde_plug",
                "/run/brickyard/sw0.ctl",
                "=",
                "/usr/bin/vde_plug",
                "/run/brickyard/sw1.ctl",
            ]
        );
    }

    #[test]
    fn qemu_plugs_get_generated_macs() {
        let mut brick = Brick::new("vm0", BrickKind::Qemu);
        brick.add_plug();
        let mac = brick.plugs()[0].mac.clone().unwrap();
        assert!(super::super::probe::mac_is_valid(&mac));
        assert!(mac.starts_with("00:aa:"));
    }

    #[test]
    fn qemu_args_include_vde_netdev_per_plug() {
        let mut brick = Brick::new("vm0", BrickKind::Qemu);
        brick.add_plug();
        brick.connect_plug(0, "sw0".to_string()).unwrap();
        brick.config_mut().set("hda", "/images/disk.qcow2");
        let ctx = CommandContext {
            workspace: Path::new("/run/brickyard"),
            peer_sockets: vec![PathBuf::from("/run/brickyard/sw0.ctl")],
            vde_plug: None,
            wirefilter: None,
        };
        let args = brick.build_args(&ctx).unwrap();
        assert!(args.contains(&"-hda".to_string()));
        assert!(args.iter().any(|arg| arg.starts_with("nic,vlan=0,macaddr=00:aa:")));
        assert!(
            args.contains(&"vde,vlan=0,sock=/run/brickyard/sw0.ctl".to_string())
        );
    }

    #[test]
    fn switch_wrapper_wraps_an_external_socket() {
        let mut brick = Brick::new("ext0", BrickKind::SwitchWrapper);
        assert!(matches!(brick.validate(), Err(Error::BadConfig { .. })));
        brick.config_mut().set("path", "/var/run/vde.ctl");
        brick.validate().unwrap();
        assert_eq!(
            brick.socket_path(Path::new("/run/brickyard")),
            Some(PathBuf::from("/var/run/vde.ctl"))
        );
        assert!(brick.binary_name().is_none());
    }
}
