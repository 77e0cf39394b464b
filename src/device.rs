//! Async, sector-addressed block-device contract.
//!
//! `BlockDevice` is the one seam between this crate and the outside world
//! for raw I/O: GPT partitioning, the physical driver, and multiplexing
//! across partitions are all external collaborators that need only
//! produce something implementing this trait — a GPT-partition-backed
//! device is just another implementor, nothing here assumes a whole-disk
//! device.

use crate::error::{BlockFsError, Result};

/// An async, sector-addressed block device with a fixed `sector_size`.
///
/// All reads are sector-aligned in both offset and length: callers pass
/// an LBA and a sector count, never a byte range. Implementations fail
/// only on I/O error; a short read is an error, not a partial result.
pub trait BlockDevice: Send + Sync {
    /// Size of one sector in bytes. Power of two, typically 512 or 4096.
    fn sector_size(&self) -> usize;

    /// Device size in bytes.
    fn size(&self) -> u64;

    /// Opaque identifier of this device's parent in the external bus
    /// hierarchy. Never interpreted by this crate; carried through so a
    /// transport layer can advertise it alongside the mounted filesystem.
    fn parent_id(&self) -> i64;

    /// Fill `out` with exactly `count * sector_size()` bytes starting at
    /// LBA `lba`. `out.len()` must equal `count * sector_size()`.
    fn read_sectors(
        &self,
        lba: u64,
        count: usize,
        out: &mut [u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Optional write path. Btrfs never calls this; ext2 calls it only
    /// when built with the `ext2-write` feature. Implementations that
    /// don't support writes return `Unsupported`.
    fn write_sectors(
        &self,
        _lba: u64,
        _count: usize,
        _data: &[u8],
    ) -> impl Future<Output = Result<()>> + Send {
        async { Err(BlockFsError::Unsupported("write_sectors")) }
    }
}

/// Read `len` bytes starting at byte offset `offset`, expanding to full
/// sectors as needed and returning only the requested sub-range.
///
/// This is the byte-oriented convenience every higher layer actually wants;
/// `BlockDevice` itself stays strictly sector-granular.
pub async fn read_bytes<D: BlockDevice + ?Sized>(
    device: &D,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let sector_size = device.sector_size() as u64;
    let first_lba = offset / sector_size;
    let within = (offset - first_lba * sector_size) as usize;
    let last_byte = offset + len as u64;
    let last_lba = last_byte.div_ceil(sector_size);
    let count = (last_lba - first_lba) as usize;

    let mut buf = vec![0u8; count * sector_size as usize];
    device.read_sectors(first_lba, count, &mut buf).await?;
    buf.drain(..within);
    buf.truncate(len);
    Ok(buf)
}

#[cfg(feature = "io")]
pub mod file {
    //! Direct-I/O, file-backed `BlockDevice`: aligned buffers,
    //! `O_DIRECT`/`F_NOCACHE` open flags, platform-specific
    //! configuration, and `pread`/`pwrite` via `libc`.

    use std::ffi::CString;
    use std::os::fd::RawFd;

    use aligned_vec::{AVec, ConstAlign};

    use super::BlockDevice;
    use crate::error::{BlockFsError, Result};

    const IO_ALIGN: usize = 512;

    #[cfg(target_os = "linux")]
    fn direct_open_flags() -> libc::c_int {
        libc::O_RDWR | libc::O_DIRECT
    }

    #[cfg(target_os = "macos")]
    fn direct_open_flags() -> libc::c_int {
        libc::O_RDWR
    }

    #[cfg(target_os = "macos")]
    fn configure_direct_io(fd: RawFd) -> std::io::Result<()> {
        let ret = unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
        if ret == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn configure_direct_io(_fd: RawFd) -> std::io::Result<()> {
        Ok(())
    }

    /// A block device backed by a real file or device node, opened for
    /// direct I/O. Reads and writes go straight through `pread`/`pwrite`;
    /// no OS page cache sits between this device and the disk (the fault
    /// handler in `cache` is this crate's own page cache).
    pub struct FileBlockDevice {
        fd: RawFd,
        sector_size: usize,
        size: u64,
        parent_id: i64,
    }

    // Safety: the fd is never shared mutably; pread/pwrite take an
    // explicit offset so concurrent calls from different tasks don't race.
    unsafe impl Send for FileBlockDevice {}
    unsafe impl Sync for FileBlockDevice {}

    impl FileBlockDevice {
        pub fn open(path: &str, sector_size: usize, parent_id: i64) -> Result<Self> {
            let c_path = CString::new(path)
                .map_err(|_| BlockFsError::Parse("device path contains NUL"))?;
            let fd = unsafe { libc::open(c_path.as_ptr(), direct_open_flags()) };
            if fd < 0 {
                return Err(BlockFsError::Io(std::io::Error::last_os_error()));
            }
            configure_direct_io(fd).map_err(BlockFsError::Io)?;

            let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
            if size < 0 {
                unsafe { libc::close(fd) };
                return Err(BlockFsError::Io(std::io::Error::last_os_error()));
            }

            Ok(Self {
                fd,
                sector_size,
                size: size as u64,
                parent_id,
            })
        }

        fn alloc_aligned(len: usize) -> AVec<u8, ConstAlign<IO_ALIGN>> {
            AVec::from_iter(IO_ALIGN, std::iter::repeat_n(0u8, len))
        }
    }

    impl BlockDevice for FileBlockDevice {
        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn size(&self) -> u64 {
            self.size
        }

        fn parent_id(&self) -> i64 {
            self.parent_id
        }

        async fn read_sectors(&self, lba: u64, count: usize, out: &mut [u8]) -> Result<()> {
            let len = count * self.sector_size;
            if out.len() != len {
                return Err(BlockFsError::Parse("read_sectors: buffer length mismatch"));
            }
            let offset = lba * self.sector_size as u64;

            let mut aligned = Self::alloc_aligned(len);
            let mut total = 0usize;
            while total < len {
                let ret = unsafe {
                    libc::pread(
                        self.fd,
                        aligned[total..].as_mut_ptr() as *mut libc::c_void,
                        len - total,
                        (offset + total as u64) as libc::off_t,
                    )
                };
                if ret < 0 {
                    return Err(BlockFsError::Io(std::io::Error::last_os_error()));
                }
                if ret == 0 {
                    return Err(BlockFsError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "unexpected EOF during pread",
                    )));
                }
                total += ret as usize;
            }
            out.copy_from_slice(&aligned[..len]);
            Ok(())
        }

        async fn write_sectors(&self, lba: u64, count: usize, data: &[u8]) -> Result<()> {
            let len = count * self.sector_size;
            if data.len() != len {
                return Err(BlockFsError::Parse("write_sectors: buffer length mismatch"));
            }
            let offset = lba * self.sector_size as u64;

            let mut aligned = Self::alloc_aligned(len);
            aligned.copy_from_slice(data);

            let mut total = 0usize;
            while total < len {
                let ret = unsafe {
                    libc::pwrite(
                        self.fd,
                        aligned[total..].as_ptr() as *const libc::c_void,
                        len - total,
                        (offset + total as u64) as libc::off_t,
                    )
                };
                if ret < 0 {
                    return Err(BlockFsError::Io(std::io::Error::last_os_error()));
                }
                total += ret as usize;
            }
            Ok(())
        }
    }

    impl Drop for FileBlockDevice {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// In-memory `BlockDevice` test double, backed by a plain `Vec<u8>`.
///
/// Used throughout `tests/` to build synthetic Btrfs/ext2 images without
/// touching a real file.
pub struct MemBlockDevice {
    sector_size: usize,
    data: std::sync::RwLock<Vec<u8>>,
    parent_id: i64,
}

impl MemBlockDevice {
    pub fn new(sector_size: usize, data: Vec<u8>) -> Self {
        Self::with_parent_id(sector_size, data, 0)
    }

    pub fn with_parent_id(sector_size: usize, data: Vec<u8>, parent_id: i64) -> Self {
        assert!(sector_size.is_power_of_two());
        assert_eq!(data.len() % sector_size, 0);
        Self {
            sector_size,
            data: std::sync::RwLock::new(data),
            parent_id,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn size(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }

    fn parent_id(&self) -> i64 {
        self.parent_id
    }

    async fn read_sectors(&self, lba: u64, count: usize, out: &mut [u8]) -> Result<()> {
        let len = count * self.sector_size;
        if out.len() != len {
            return Err(BlockFsError::Parse("read_sectors: buffer length mismatch"));
        }
        let start = lba as usize * self.sector_size;
        let data = self.data.read().unwrap();
        if start + len > data.len() {
            return Err(BlockFsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        out.copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    async fn write_sectors(&self, lba: u64, count: usize, data_in: &[u8]) -> Result<()> {
        let len = count * self.sector_size;
        if data_in.len() != len {
            return Err(BlockFsError::Parse("write_sectors: buffer length mismatch"));
        }
        let start = lba as usize * self.sector_size;
        let mut data = self.data.write().unwrap();
        if start + len > data.len() {
            return Err(BlockFsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of device",
            )));
        }
        data[start..start + len].copy_from_slice(data_in);
        Ok(())
    }
}
