//! Program deployment to the agent: upload under a temporary name, then rename into place.
use crate::debugger::error::Error;
use crate::debugger::remote::channel::RemoteChannel;
use crate::debugger::remote::proto::Request;
use crate::weak_error;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Upload `local` into `remote_dir` (relative to the agent root) and return its remote path.
///
/// A stale copy of the program is deleted first, chunks are pipelined through the request queue
/// and the file only gets its final name once completely written. A failed upload closes and
/// deletes the partial file.
pub fn deploy(
    channel: &mut RemoteChannel,
    local: &Path,
    remote_dir: &Path,
    chunk_size: usize,
) -> Result<PathBuf, Error> {
    let data = fs::read(local)?;
    let name = local.file_name().ok_or_else(|| Error::NotFound(format!(
        "file name in {}",
        local.display()
    )))?;
    let remote = remote_dir.join(name);
    let mut partial = remote.clone().into_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    channel.call::<()>(&Request::DeleteFile {
        path: remote.clone(),
    })?;
    let handle: u32 = channel.call(&Request::OpenFile {
        path: partial.clone(),
    })?;

    let uploaded = upload(channel, handle, &data, chunk_size);
    let closed = channel.call::<()>(&Request::CloseFile { handle });
    let chunks = match uploaded.and_then(|chunks| closed.map(|_| chunks)) {
        Ok(chunks) => chunks,
        Err(e) => {
            if !e.is_fatal() {
                weak_error!(
                    channel.call::<()>(&Request::DeleteFile { path: partial }),
                    "delete partial upload:"
                );
            }
            return Err(e);
        }
    };

    channel.call::<()>(&Request::RenameFile {
        from: partial,
        to: remote.clone(),
    })?;

    info!(
        target: "remote",
        "{} deployed as {} ({} bytes, {chunks} chunks)",
        local.display(),
        remote.display(),
        data.len()
    );
    Ok(remote)
}

/// Write `data` in chunks. Every submitted chunk is waited for, even after a failure, so no
/// response stays unclaimed in the channel. Returns the number of chunks.
fn upload(
    channel: &mut RemoteChannel,
    handle: u32,
    data: &[u8],
    chunk_size: usize,
) -> Result<usize, Error> {
    let mut tickets = vec![];
    let mut first_error = None;
    for chunk in data.chunks(chunk_size.max(1)) {
        match channel.submit(&Request::WriteChunk {
            handle,
            data: chunk.to_vec(),
        }) {
            Ok(ticket) => tickets.push(ticket),
            Err(e) => {
                first_error = Some(e);
                break;
            }
        }
    }

    let chunks = tickets.len();
    for ticket in tickets {
        if let Err(e) = channel.wait(ticket) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(chunks),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::remote::codec::FrameDecoder;
    use crate::debugger::remote::proto::Response;
    use crate::debugger::transport::{MemoryTransport, Transport};
    use std::thread;
    use std::time::Duration;

    /// Agent answering every request, the write of chunk number `fail_chunk` (from 1) fails.
    fn serve(mut transport: MemoryTransport, fail_chunk: usize) -> thread::JoinHandle<Vec<Request>> {
        thread::spawn(move || {
            let mut decoder = FrameDecoder::default();
            let mut requests = vec![];
            let mut chunks = 0;
            let mut buf = [0u8; 4096];
            loop {
                match transport.recv(&mut buf, Duration::from_millis(500)) {
                    Ok(0) | Err(_) => return requests,
                    Ok(n) => decoder.feed(&buf[..n]),
                }
                while let Some(frame) = decoder.next_frame().unwrap() {
                    let request = Request::from_frame(&frame).unwrap();
                    let response = match &request {
                        Request::OpenFile { .. } => Response::ok(&7u32),
                        Request::WriteChunk { .. } => {
                            chunks += 1;
                            if chunks == fail_chunk {
                                Response::Fail("disk full".to_string())
                            } else {
                                Response::ok(&())
                            }
                        }
                        _ => Response::ok(&()),
                    };
                    transport.send(&response.to_frame(frame.seq).to_bytes().unwrap()).unwrap();
                    requests.push(request);
                }
            }
        })
    }

    fn program(name: &str, len: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mdbg-deploy-{}-{name}", std::process::id()));
        fs::write(&path, vec![0xAB; len]).unwrap();
        path
    }

    #[test]
    fn test_deploy() {
        struct TestCase {
            name: &'static str,
            fail_chunk: usize,
            expected: Vec<&'static str>,
        }
        let cases = vec![
            TestCase {
                name: "complete",
                fail_chunk: 0,
                expected: vec![
                    "delete-file",
                    "open-file",
                    "write-chunk",
                    "write-chunk",
                    "write-chunk",
                    "close-file",
                    "rename-file",
                ],
            },
            TestCase {
                name: "failing-chunk",
                fail_chunk: 2,
                expected: vec![
                    "delete-file",
                    "open-file",
                    "write-chunk",
                    "write-chunk",
                    "write-chunk",
                    "close-file",
                    "delete-file",
                ],
            },
        ];

        for tc in cases {
            let local = program(tc.name, 10);
            let (host, agent) = MemoryTransport::pair();
            let handle = serve(agent, tc.fail_chunk);
            let mut channel = RemoteChannel::new(Box::new(host), Duration::from_secs(5), 0);

            let result = deploy(&mut channel, &local, Path::new("deploy"), 4);
            assert_eq!(channel.pending(), 0, "{}", tc.name);
            assert_eq!(channel.unclaimed(), 0, "{}", tc.name);
            drop(channel);
            let requests = handle.join().unwrap();
            let names: Vec<_> = requests.iter().map(Request::name).collect();
            assert_eq!(names, tc.expected, "{}", tc.name);

            let file_name = local.file_name().unwrap().to_string_lossy().to_string();
            if tc.fail_chunk == 0 {
                assert_eq!(result.unwrap(), Path::new("deploy").join(&file_name));
            } else {
                assert!(matches!(
                    result,
                    Err(Error::BackendRejected { ref message, .. }) if message == "disk full"
                ));
                assert_eq!(
                    requests.last(),
                    Some(&Request::DeleteFile {
                        path: PathBuf::from(format!("deploy/{file_name}.part")),
                    })
                );
            }
            fs::remove_file(local).unwrap();
        }
    }
}
