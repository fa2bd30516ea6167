//! PADME length padding.
//!
//! Rounds a plaintext length up so that at most `floor(log2(E)) + 1` of its
//! low bits are significant, `E = floor(log2(n))`. Ciphertext length then
//! leaks only the rough magnitude of the change. Overhead stays under 12%.

/// Padded length for a plaintext of `n` bytes.
pub fn padded_len(n: usize) -> usize {
    if n <= 1 {
        return n;
    }
    let e = usize::BITS - 1 - n.leading_zeros();
    let s = u32::BITS - 1 - e.leading_zeros() + 1;
    let mask = (1usize << (e - s)) - 1;
    n.checked_add(mask).map_or(n, |v| v & !mask)
}
