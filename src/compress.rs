
/// A pluggable per-datagram compressor.
///
/// When installed on a host, every outgoing datagram's command region (everything
/// after the protocol header) is offered to [`compress`](Self::compress). If the
/// compressor produces strictly fewer bytes than the input, the datagram is sent
/// compressed and the receiving host's compressor reverses the transform.
///
/// Both hosts must be configured with compressors implementing the same algorithm.
pub trait Compressor {
    /// Compresses `data` into `output`, returning the number of bytes written.
    ///
    /// Returns `None` if the data cannot be represented in fewer than `data.len()`
    /// bytes; the datagram is then sent uncompressed. `output` is always at least
    /// `data.len()` bytes long.
    fn compress(&mut self, data: &[u8], output: &mut [u8]) -> Option<usize>;

    /// Decompresses `data` into `output`, returning the number of bytes written.
    ///
    /// Returns `None` if the input is malformed or the result would not fit in
    /// `output`; the datagram is then discarded.
    fn decompress(&mut self, data: &[u8], output: &mut [u8]) -> Option<usize>;
}
