use std::collections::HashMap;
use std::time::Duration;

use log::{trace, warn};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::error::FastCgiError;
use crate::fastcgi::record::{self, RecordType, REQUEST_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

#[derive(Debug, Clone)]
pub struct FastCgiPoolConfig {
    pub listen: String,
    pub transport: Transport,
    pub pool_size: usize,
    pub dial_timeout: Duration,
    pub read_write_timeout: Duration,
}

impl FastCgiPoolConfig {
    pub fn new(listen: String, transport: Transport) -> Self {
        FastCgiPoolConfig {
            listen,
            transport,
            pool_size: 0,
            dial_timeout: Duration::from_secs(30),
            read_write_timeout: Duration::from_secs(10),
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

pub struct FastCgiResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
}

pub struct FastCgiPool {
    config: FastCgiPoolConfig,
    reserve: Mutex<Vec<Connection>>,
}

impl FastCgiPool {
    pub fn new(config: FastCgiPoolConfig) -> Self {
        FastCgiPool { config, reserve: Mutex::new(Vec::new()) }
    }

    async fn get_connection(&self) -> Result<Connection, FastCgiError> {
        if self.config.pool_size > 0 {
            let mut reserve = self.reserve.lock().await;
            if let Some(conn) = reserve.pop() {
                trace!("reused pooled FastCGI connection to {}", self.config.listen);
                return Ok(conn);
            }
        }
        self.dial().await
    }

    async fn dial(&self) -> Result<Connection, FastCgiError> {
        let dial = async {
            match self.config.transport {
                Transport::Tcp => TcpStream::connect(&self.config.listen).await.map(Connection::Tcp),
                Transport::Unix => UnixStream::connect(&self.config.listen).await.map(Connection::Unix),
            }
        };

        tokio::time::timeout(self.config.dial_timeout, dial)
            .await
            .map_err(|_| FastCgiError::Timeout)?
            .map_err(|e| FastCgiError::Dial(self.config.listen.clone(), e))
    }

    async fn put_connection(&self, conn: Connection) {
        if self.config.pool_size == 0 {
            return;
        }
        let mut reserve = self.reserve.lock().await;
        if reserve.len() < self.config.pool_size {
            reserve.push(conn);
        }
        // else: drop(conn) closes it.
    }

    pub async fn do_request(&self, params: HashMap<String, String>, stdin: Vec<u8>) -> Result<FastCgiResponse, FastCgiError> {
        let conn = self.get_connection().await?;

        match self.run_request(conn, params, stdin).await {
            Ok((response, conn)) => {
                self.put_connection(conn).await;
                Ok(response)
            }
            Err(e) => {
                warn!("FastCGI request to {} failed, discarding connection: {}", self.config.listen, e);
                Err(e)
            }
        }
    }

    async fn run_request(&self, mut conn: Connection, params: HashMap<String, String>, stdin: Vec<u8>) -> Result<(FastCgiResponse, Connection), FastCgiError> {
        let work = async {
            self.send_request(&mut conn, &params, &stdin).await?;
            self.read_response(&mut conn).await
        };

        let response = tokio::time::timeout(self.config.read_write_timeout, work)
            .await
            .map_err(|_| FastCgiError::Timeout)??;

        Ok((response, conn))
    }

    async fn send_request(&self, conn: &mut Connection, params: &HashMap<String, String>, stdin: &[u8]) -> Result<(), FastCgiError> {
        macro_rules! write_via {
            ($c:expr, $bytes:expr) => {
                match $c {
                    Connection::Tcp(s) => record::write_all(s, $bytes).await,
                    Connection::Unix(s) => record::write_all(s, $bytes).await,
                }
            };
        }

        write_via!(conn, &record::encode_begin_request(REQUEST_ID))?;
        write_via!(conn, &record::encode_params(params, REQUEST_ID))?;
        write_via!(conn, &record::encode_empty(RecordType::Params, REQUEST_ID))?;

        const CHUNK: usize = 65535;
        for chunk in stdin.chunks(CHUNK) {
            write_via!(conn, &record::encode_stdin_chunk(chunk, REQUEST_ID))?;
        }
        write_via!(conn, &record::encode_empty(RecordType::Stdin, REQUEST_ID))?;

        Ok(())
    }

    async fn read_response(&self, conn: &mut Connection) -> Result<FastCgiResponse, FastCgiError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let record = match conn {
                Connection::Tcp(s) => record::read_record(s).await?,
                Connection::Unix(s) => record::read_record(s).await?,
            };

            match record.kind {
                RecordType::Stdout => stdout.extend(record.content),
                RecordType::Stderr => stderr.extend(record.content),
                RecordType::EndRequest => {
                    let (app_status, _protocol_status) = record::decode_end_request(&record)?;
                    return Ok(FastCgiResponse { stdout, stderr, app_status });
                }
                _ => {
                    // A well-behaved Responder never sends BeginRequest/Params/Stdin back;
                    // treat anything unexpected as a protocol error rather than looping forever.
                    return Err(FastCgiError::ProtocolDecode);
                }
            }
        }
    }
}
