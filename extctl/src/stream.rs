use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use crate::error::*;

pub trait Stream: Read + Write + Send + Sync {
    fn shutdown(&mut self) -> Result<()>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
    fn peek(&mut self, buf: &mut [u8]) -> ::std::io::Result<usize>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b).map_err(map_context!())?;
        Ok(())
    }

    #[inline]
    fn peek(&mut self, buf: &mut [u8]) -> ::std::io::Result<usize> {
        TcpStream::peek(self, buf)
    }
}
