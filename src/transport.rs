//! Transport binding for associations.
//!
//! An association runs over any byte stream implementing [`Transport`]:
//! reading and writing PDUs, a readability poll for the idle timer,
//! and an orderly close. [`TcpTransport`] is the standard binding over
//! [`TcpStream`]; alternative bindings (for instance a TLS wrapper)
//! can implement the trait without touching the protocol engine.
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A byte stream capable of carrying an association.
pub trait Transport: Read + Write + Send {
    /// Check whether at least one byte can be read without blocking,
    /// waiting at most for the given duration.
    fn has_data_available(&mut self, timeout: Duration) -> std::io::Result<bool>;

    /// Shut down the stream in both directions.
    ///
    /// Blocked reads and writes on clones of this transport
    /// are expected to fail promptly afterwards.
    fn close(&mut self) -> std::io::Result<()>;

    /// A human readable description of the peer,
    /// for log messages.
    fn peer_description(&self) -> String;

    /// Obtain an independent handle over the same stream,
    /// so that one thread may read while another writes.
    fn try_clone(&self) -> std::io::Result<Box<dyn Transport>>;
}

/// Socket-level options for TCP transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// timeout for establishing the connection
    pub connect_timeout: Option<Duration>,
    /// timeout for each socket read
    pub read_timeout: Option<Duration>,
    /// timeout for each socket write
    pub write_timeout: Option<Duration>,
    /// whether to disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            connect_timeout: None,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(60)),
            nodelay: true,
        }
    }
}

/// The standard TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    /// the read timeout to restore after a readability poll
    read_timeout: Option<Duration>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Connect to the given address and apply the socket options.
    pub fn connect<A: ToSocketAddrs>(
        address: A,
        options: &SocketOptions,
    ) -> std::io::Result<Self> {
        let stream = match options.connect_timeout {
            Some(timeout) => {
                let mut result = Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "could not resolve address",
                ));
                for address in address.to_socket_addrs()? {
                    result = TcpStream::connect_timeout(&address, timeout);
                    if result.is_ok() {
                        break;
                    }
                }
                result?
            }
            None => TcpStream::connect(address)?,
        };
        Self::from_stream(stream, options)
    }

    /// Wrap an already connected stream and apply the socket options.
    pub fn from_stream(stream: TcpStream, options: &SocketOptions) -> std::io::Result<Self> {
        stream.set_read_timeout(options.read_timeout)?;
        stream.set_write_timeout(options.write_timeout)?;
        stream.set_nodelay(options.nodelay)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(TcpTransport {
            stream,
            read_timeout: options.read_timeout,
            peer_addr,
        })
    }

    /// The address of the connected peer, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn has_data_available(&mut self, timeout: Duration) -> std::io::Result<bool> {
        // peek under a temporary read timeout,
        // putting the configured one back afterwards
        self.stream.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let outcome = match self.stream.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.stream.set_read_timeout(self.read_timeout)?;
        outcome
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    fn peer_description(&self) -> String {
        match self.peer_addr {
            Some(addr) => addr.to_string(),
            None => "<unconnected>".to_string(),
        }
    }

    fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport {
            stream: self.stream.try_clone()?,
            read_timeout: self.read_timeout,
            peer_addr: self.peer_addr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::connect(addr, &SocketOptions::default()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (transport, peer)
    }

    #[test]
    fn readability_poll_reflects_pending_bytes() {
        let (mut transport, mut peer) = loopback_pair();

        assert!(!transport
            .has_data_available(Duration::from_millis(20))
            .unwrap());

        peer.write_all(b"\x05\x00").unwrap();
        assert!(transport
            .has_data_available(Duration::from_millis(500))
            .unwrap());

        // peeking does not consume, the bytes are still readable
        let mut buf = [0u8; 2];
        transport.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\x05\x00");
    }

    #[test]
    fn close_unblocks_reads_on_clones() {
        let (mut transport, _peer) = loopback_pair();
        let mut reader = transport.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(50));
        transport.close().unwrap();
        // a shut down socket yields either EOF or an error, never a hang
        let outcome = handle.join().unwrap();
        match outcome {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected read of {} bytes", n),
        }
    }
}
