use std::env;

use crate::watch::{DeviceType, WatchSettings};

#[derive(Debug, Default)]
pub struct Args {
    pub pretty: bool,
    pub watch: bool,
    pub settings: WatchSettings,
    /// `host:port` endpoints to `connect:` before watching.
    pub ip_list: Vec<String>,
}

impl Args {
    pub fn parse() -> Option<Self> {
        let argv: Vec<String> = env::args().collect();

        let mut args = Args {
            settings: WatchSettings::default(),
            ..Default::default()
        };

        for arg in argv.iter().skip(1) {
            if arg == "--help" || arg == "-h" {
                print_help();
                return None;
            } else if arg == "--version" || arg == "-v" {
                println!("dev-watch v{}", env!("APP_VERSION_DISPLAY"));
                return None;
            } else if arg == "--pretty" {
                args.pretty = true;
            } else if arg == "--watch" || arg == "-w" {
                args.watch = true;
            } else if arg == "--no-adb" {
                args.settings.enable_adb_client = false;
            } else if let Some(val) = arg.strip_prefix("--types=") {
                for filter in val.split('|').filter(|s| !s.is_empty()) {
                    args.settings.type_filters.push(DeviceType::parse(filter));
                }
            } else if let Some(val) = arg.strip_prefix("--vids=") {
                parse_id_list(
                    &mut args.settings.include_vids,
                    &mut args.settings.exclude_vids,
                    val,
                )?;
            } else if let Some(val) = arg.strip_prefix("--pids=") {
                parse_id_list(
                    &mut args.settings.include_pids,
                    &mut args.settings.exclude_pids,
                    val,
                )?;
            } else if let Some(val) = arg.strip_prefix("--drivers=") {
                args.settings
                    .drivers
                    .extend(val.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            } else if let Some(val) = arg.strip_prefix("--ip-list=") {
                args.ip_list
                    .extend(val.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            } else if let Some(val) = arg.strip_prefix("--usbserial-vidpid=") {
                for pair in val.split(',').filter(|s| !s.is_empty()) {
                    let Some((vid, pid)) = parse_vid_pid(pair) else {
                        eprintln!("invalid vid:pid format: {pair}");
                        return None;
                    };
                    args.settings.usb_serial_vid_pids.push((vid, pid));
                }
            } else {
                eprintln!("unknown argument: {arg}");
                print_help();
                return None;
            }
        }

        Some(args)
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// `2c7c,!1234` grammar: plain entries are includes, `!`-prefixed excludes.
fn parse_id_list(includes: &mut Vec<u16>, excludes: &mut Vec<u16>, arg: &str) -> Option<()> {
    for item in arg.split(',').filter(|s| !s.is_empty()) {
        if let Some(rest) = item.strip_prefix('!') {
            excludes.push(parse_u16(rest)?);
        } else {
            includes.push(parse_u16(item)?);
        }
    }
    Some(())
}

fn parse_vid_pid(pair: &str) -> Option<(u16, u16)> {
    let (vid, pid) = pair.split_once(':')?;
    Some((parse_u16(vid)?, parse_u16(pid)?))
}

fn print_help() {
    println!("dev-watch - watch attached device interfaces");
    println!();
    println!("USAGE:");
    println!("    dev-watch [FLAGS]");
    println!();
    println!("FLAGS:");
    println!("    --watch, -w              Keep watching after the initial enumeration");
    println!("    --pretty                 Pretty-print the JSON output");
    println!("    --no-adb                 Do not poll the ADB server");
    println!("    --types=LIST             Type filters, e.g. \"usb,adb|net\"");
    println!("    --vids=LIST              VID include/exclude list, e.g. \"0x2c7c,!0x1234\"");
    println!("    --pids=LIST              PID include/exclude list, same grammar");
    println!("    --drivers=LIST           Driver allow-list, e.g. \"qcserial,option\"");
    println!("    --ip-list=LIST           host:port endpoints to connect first");
    println!("    --usbserial-vidpid=LIST  vid:pid pairs to rebind to usbserial (needs root)");
    println!("    --help, -h               Show this help message");
    println!("    --version, -v            Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    dev-watch --watch --pretty");
    println!("    dev-watch --types=\"usb,adb|serial\" --vids=\"0x2c7c\"");
}
