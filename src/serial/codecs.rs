/// Line delimited codecs, as used by the AT command protocol.
pub mod lines;
