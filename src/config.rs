/* This file is part of fileferry.
 *
 * fileferry is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * fileferry is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with fileferry.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_derive::Deserialize;

const DEFAULT_PORT: u16 = 1256;
const DEFAULT_DATA_ROOT: &str = "files";
const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

pub struct ServerConfig {
    /* Listen address for the session server */
    pub listen_address: String,

    /* Root directory under which `<user_name>/<file_name>[.enc]` live */
    pub data_root: PathBuf,

    /* Sanity cap on a single request's payload_size; not named by the
     * wire protocol itself, but nothing should accept an unbounded
     * allocation just because a header claims one. */
    pub max_payload_size: u32,
}

impl ServerConfig {
    /// Build the config the way the server is expected to run: the port
    /// comes from `port.info` in the working directory (falling back to
    /// `DEFAULT_PORT` when absent), and everything else from an optional
    /// `fileferry.toml` in the working directory.
    pub fn load() -> Result<ServerConfig> {
        let port = read_port_info(&PathBuf::from("port.info"))?;
        let overrides = read_toml_overrides(&PathBuf::from("fileferry.toml"))?;

        Ok(ServerConfig {
            listen_address: format!("127.0.0.1:{port}"),
            data_root: overrides.data_root.map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT)),
            max_payload_size: overrides.max_payload_size.unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE),
        })
    }
}

fn read_port_info(path: &std::path::Path) -> Result<u16> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse::<u16>()
            .with_context(|| format!("{} does not contain a valid port number", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DEFAULT_PORT),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[derive(Deserialize, Default)]
struct TomlOverrides {
    data_root: Option<String>,
    max_payload_size: Option<u32>,
}

fn read_toml_overrides(path: &std::path::Path) -> Result<TomlOverrides> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TomlOverrides::default()),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[test]
fn test_read_port_info_defaults_when_missing() {
    let port = read_port_info(std::path::Path::new("/nonexistent/port.info")).unwrap();
    assert_eq!(port, DEFAULT_PORT);
}

#[test]
fn test_read_port_info_parses_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("port.info");
    std::fs::write(&path, "1999\n").unwrap();
    assert_eq!(read_port_info(&path).unwrap(), 1999);
}

#[test]
fn test_read_toml_overrides_defaults_when_missing() {
    let overrides = read_toml_overrides(std::path::Path::new("/nonexistent/fileferry.toml")).unwrap();
    assert!(overrides.data_root.is_none());
    assert!(overrides.max_payload_size.is_none());
}
