//! A wallet is synced when its local projection matches the chain head known
//! to the active back-end.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Synchronisation states of an account projection. Every controller exposes
/// exactly one of these variants per tracked asset.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// No back-end is running, or a sustained failure stopped the last one.
    /// The reason is present only for failure, never for a plain stop.
    NotSynced(Option<String>),
    /// A back-end is running and catching up. Progress is only known for
    /// header-chain sync; API polling reports `None`.
    Syncing(Option<f32>),
    /// The local projection matches the last observed chain head.
    Synced,
}

impl SyncStatus {
    /// A wrapper matching the Synced case.
    /// # Examples
    ///
    /// ```
    /// use ember_status::sync_status::SyncStatus;
    ///
    /// assert!(!SyncStatus::NotSynced(None).is_synced());
    /// assert!(!SyncStatus::Syncing(Some(0.5)).is_synced());
    /// assert!(SyncStatus::Synced.is_synced());
    /// ```
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// A wrapper matching the Syncing case.
    /// # Examples
    ///
    /// ```
    /// use ember_status::sync_status::SyncStatus;
    ///
    /// assert!(SyncStatus::Syncing(None).is_syncing());
    /// assert!(!SyncStatus::Synced.is_syncing());
    /// ```
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing(_))
    }

    /// Header-sync progress in `[0, 1]` if the active back-end reports one.
    #[must_use]
    pub fn progress(&self) -> Option<f32> {
        match self {
            Self::Syncing(progress) => *progress,
            _ => None,
        }
    }

    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize from `reader`.
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;

        Ok(match reader.read_u8()? {
            0 => {
                let reason_len = reader.read_u32::<LittleEndian>()?;
                if reason_len == 0 {
                    Self::NotSynced(None)
                } else {
                    let mut reason = vec![0; reason_len as usize];
                    reader.read_exact(&mut reason)?;
                    Self::NotSynced(Some(String::from_utf8(reason).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                    })?))
                }
            }
            1 => match reader.read_u8()? {
                0 => Self::Syncing(None),
                _ => Self::Syncing(Some(reader.read_f32::<LittleEndian>()?)),
            },
            2 => Self::Synced,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "failed to read valid sync status",
                ));
            }
        })
    }

    /// Serialize into `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;

        match self {
            Self::NotSynced(reason) => {
                writer.write_u8(0)?;
                match reason {
                    None => writer.write_u32::<LittleEndian>(0)?,
                    Some(reason) => {
                        writer.write_u32::<LittleEndian>(reason.len() as u32)?;
                        writer.write_all(reason.as_bytes())?;
                    }
                }
            }
            Self::Syncing(progress) => {
                writer.write_u8(1)?;
                match progress {
                    None => writer.write_u8(0)?,
                    Some(progress) => {
                        writer.write_u8(1)?;
                        writer.write_f32::<LittleEndian>(*progress)?;
                    }
                }
            }
            Self::Synced => writer.write_u8(2)?,
        }

        Ok(())
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSynced(None) => write!(f, "not synced"),
            Self::NotSynced(Some(reason)) => write!(f, "not synced: {reason}"),
            Self::Syncing(None) => write!(f, "syncing"),
            Self::Syncing(Some(progress)) => {
                write!(f, "syncing: {:.1}%", progress * 100.0)
            }
            Self::Synced => write!(f, "synced"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SyncStatus;

    #[test]
    fn read_write_round_trip() {
        for status in [
            SyncStatus::NotSynced(None),
            SyncStatus::NotSynced(Some("peer unreachable".to_string())),
            SyncStatus::Syncing(None),
            SyncStatus::Syncing(Some(0.25)),
            SyncStatus::Synced,
        ] {
            let mut buffer = Vec::new();
            status.write(&mut buffer).unwrap();
            assert_eq!(SyncStatus::read(&buffer[..]).unwrap(), status);
        }
    }

    #[test]
    fn invalid_variant_rejected() {
        assert!(SyncStatus::read(&[0u8, 9][..]).is_err());
    }
}
