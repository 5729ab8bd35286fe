//! EVENT_RECORD → DecodedEvent using the Trace Data Helper (TDH) API.
//!
//! Properties are walked in schema order. Every scalar is rendered with
//! `TdhFormatProperty`, which also tells us how many payload bytes it used,
//! so the payload is consumed front to back. Integer values are remembered
//! by property index because later properties may take their array count or
//! byte length from them.

use std::mem;
use std::ptr;

use windows_sys::Win32::System::Diagnostics::Etw::{
    TdhFormatProperty, TdhGetEventInformation, TdhGetEventMapInformation, EVENT_MAP_INFO,
    EVENT_PROPERTY_INFO, EVENT_RECORD, TRACE_EVENT_INFO,
};

use super::{from_wide, ERROR_EVT_INVALID_EVENT_DATA, ERROR_INSUFFICIENT_BUFFER, ERROR_SUCCESS};
use crate::event::{
    timestamp_from_filetime, DecodeError, DecodedEvent, EventDescriptor, EventHeader,
    Properties, PropertyValue,
};
use crate::guid::ProviderGuid;

// evntcons.h / tdh.h values.
const EVENT_HEADER_FLAG_STRING_ONLY: u16 = 0x0004;
const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;
const PROPERTY_STRUCT: i32 = 0x1;
const PROPERTY_PARAM_LENGTH: i32 = 0x2;
const PROPERTY_PARAM_COUNT: i32 = 0x4;

pub(super) fn decode_event(record: &EVENT_RECORD) -> DecodedEvent {
    DecodedEvent {
        header: decode_header(record),
        properties: decode_properties(record),
    }
}

fn guid(g: &windows_sys::core::GUID) -> ProviderGuid {
    ProviderGuid::from_fields(g.data1, g.data2, g.data3, g.data4)
}

fn decode_header(record: &EVENT_RECORD) -> EventHeader {
    let h = &record.EventHeader;
    let d = &h.EventDescriptor;
    // SAFETY: both union views are plain integers.
    let (kernel_time, user_time, processor_time) = unsafe {
        (
            h.Anonymous.Anonymous.KernelTime,
            h.Anonymous.Anonymous.UserTime,
            h.Anonymous.ProcessorTime,
        )
    };

    EventHeader {
        descriptor: EventDescriptor {
            id: d.Id,
            version: d.Version,
            channel: d.Channel,
            level: d.Level,
            op_code: d.Opcode,
            task: d.Task,
            keyword: d.Keyword,
        },
        thread_id: h.ThreadId,
        process_id: h.ProcessId,
        time_stamp: timestamp_from_filetime(h.TimeStamp),
        provider_id: guid(&h.ProviderId),
        activity_id: guid(&h.ActivityId),
        flags: h.Flags,
        kernel_time,
        user_time,
        processor_time,
    }
}

fn decode_properties(record: &EVENT_RECORD) -> Result<Properties, DecodeError> {
    if record.EventHeader.Flags & EVENT_HEADER_FLAG_STRING_ONLY != 0 {
        let mut props = Properties::new();
        props.push("Data", read_wide_payload(record));
        return Ok(props);
    }

    let info = EventInfo::fetch(record)?;
    let mut decoder = Decoder {
        record,
        info: &info,
        data: record.UserData as *const u8,
        remaining: record.UserDataLength,
        pointer_size: pointer_size(record.EventHeader.Flags),
        integers: vec![None; info.property_count()],
    };
    decoder.properties(0, info.top_level_count())
}

fn pointer_size(flags: u16) -> u32 {
    if flags & EVENT_HEADER_FLAG_32_BIT_HEADER != 0 {
        4
    } else if flags & EVENT_HEADER_FLAG_64_BIT_HEADER != 0 {
        8
    } else {
        mem::size_of::<usize>() as u32
    }
}

fn read_wide_payload(record: &EVENT_RECORD) -> String {
    let len = record.UserDataLength as usize / 2;
    if record.UserData.is_null() || len == 0 {
        return String::new();
    }
    // SAFETY: ETW guarantees UserData points at UserDataLength bytes.
    let data = unsafe { std::slice::from_raw_parts(record.UserData as *const u16, len) };
    from_wide(data)
}

/// Owned `TRACE_EVENT_INFO` blob as returned by `TdhGetEventInformation`.
struct EventInfo {
    buf: Vec<u64>,
}

impl EventInfo {
    fn fetch(record: &EVENT_RECORD) -> Result<Self, DecodeError> {
        let mut size = 0u32;
        let status =
            unsafe { TdhGetEventInformation(record, 0, ptr::null(), ptr::null_mut(), &mut size) };
        if status != ERROR_INSUFFICIENT_BUFFER {
            return Err(DecodeError::MissingSchema(status));
        }

        let mut buf = vec![0u64; (size as usize).div_ceil(8)];
        let status = unsafe {
            TdhGetEventInformation(
                record,
                0,
                ptr::null(),
                buf.as_mut_ptr() as *mut TRACE_EVENT_INFO,
                &mut size,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(DecodeError::MissingSchema(status));
        }
        Ok(EventInfo { buf })
    }

    fn as_ptr(&self) -> *const TRACE_EVENT_INFO {
        self.buf.as_ptr() as *const TRACE_EVENT_INFO
    }

    fn info(&self) -> &TRACE_EVENT_INFO {
        unsafe { &*self.as_ptr() }
    }

    fn property_count(&self) -> usize {
        self.info().PropertyCount as usize
    }

    fn top_level_count(&self) -> usize {
        self.info().TopLevelPropertyCount as usize
    }

    fn property(&self, index: usize) -> &EVENT_PROPERTY_INFO {
        debug_assert!(index < self.property_count());
        // SAFETY: TDH sizes the buffer for PropertyCount entries.
        unsafe { &*self.info().EventPropertyInfoArray.as_ptr().add(index) }
    }

    /// NUL-terminated UTF-16 string at `offset` bytes into the blob.
    fn wide_at(&self, offset: u32) -> *const u16 {
        unsafe { (self.buf.as_ptr() as *const u8).add(offset as usize) as *const u16 }
    }

    fn string_at(&self, offset: u32) -> String {
        let bytes = self.buf.len() * 8;
        let start = offset as usize;
        if offset == 0 || start >= bytes {
            return String::new();
        }
        let max = (bytes - start) / 2;
        // SAFETY: bounded by the blob, TDH strings are NUL terminated.
        let slice = unsafe { std::slice::from_raw_parts(self.wide_at(offset), max) };
        from_wide(slice)
    }
}

struct Decoder<'a> {
    record: &'a EVENT_RECORD,
    info: &'a EventInfo,
    data: *const u8,
    remaining: u16,
    pointer_size: u32,
    integers: Vec<Option<u64>>,
}

impl Decoder<'_> {
    fn properties(&mut self, start: usize, end: usize) -> Result<Properties, DecodeError> {
        let info = self.info;
        let mut props = Properties::new();
        for index in start..end {
            let prop = info.property(index);
            let name = info.string_at(prop.NameOffset);
            let count = self.count(prop, &name)?;

            let value = if prop.Flags & PROPERTY_PARAM_COUNT != 0 || count > 1 {
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.single(index, &name)?);
                }
                PropertyValue::Array(items)
            } else {
                self.single(index, &name)?
            };
            props.push(name, value);
        }
        Ok(props)
    }

    fn single(&mut self, index: usize, name: &str) -> Result<PropertyValue, DecodeError> {
        let info = self.info;
        let prop = info.property(index);
        if prop.Flags & PROPERTY_STRUCT != 0 {
            // SAFETY: structType is the active view for struct properties.
            let (first, members) = unsafe {
                (
                    prop.Anonymous1.structType.StructStartIndex as usize,
                    prop.Anonymous1.structType.NumOfStructMembers as usize,
                )
            };
            return Ok(PropertyValue::Struct(self.properties(first, first + members)?));
        }

        let length = self.length(prop, name)?;
        let text = self.format(prop, name, length)?;
        if let Some(value) = parse_integer(&text) {
            self.integers[index] = Some(value);
        }
        Ok(PropertyValue::Scalar(text))
    }

    fn referenced(&self, index: u16, name: &str) -> Result<u64, DecodeError> {
        self.integers
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| DecodeError::BadReference {
                name: name.to_string(),
                index,
            })
    }

    fn count(&self, prop: &EVENT_PROPERTY_INFO, name: &str) -> Result<u64, DecodeError> {
        // SAFETY: both union views are u16.
        if prop.Flags & PROPERTY_PARAM_COUNT != 0 {
            self.referenced(unsafe { prop.Anonymous2.countPropertyIndex }, name)
        } else {
            Ok(unsafe { prop.Anonymous2.count } as u64)
        }
    }

    fn length(&self, prop: &EVENT_PROPERTY_INFO, name: &str) -> Result<u16, DecodeError> {
        // SAFETY: both union views are u16.
        if prop.Flags & PROPERTY_PARAM_LENGTH != 0 {
            let len = self.referenced(unsafe { prop.Anonymous3.lengthPropertyIndex }, name)?;
            u16::try_from(len).map_err(|_| DecodeError::Truncated(name.to_string()))
        } else {
            Ok(unsafe { prop.Anonymous3.length })
        }
    }

    fn map_info(&self, prop: &EVENT_PROPERTY_INFO) -> Option<Vec<u64>> {
        let offset = unsafe { prop.Anonymous1.nonStructType.MapNameOffset };
        if offset == 0 {
            return None;
        }
        let map_name = self.info.wide_at(offset);

        let mut size = 0u32;
        let status = unsafe {
            TdhGetEventMapInformation(self.record, map_name, ptr::null_mut(), &mut size)
        };
        if status != ERROR_INSUFFICIENT_BUFFER {
            return None;
        }
        let mut buf = vec![0u64; (size as usize).div_ceil(8)];
        let status = unsafe {
            TdhGetEventMapInformation(
                self.record,
                map_name,
                buf.as_mut_ptr() as *mut EVENT_MAP_INFO,
                &mut size,
            )
        };
        (status == ERROR_SUCCESS).then_some(buf)
    }

    fn format(
        &mut self,
        prop: &EVENT_PROPERTY_INFO,
        name: &str,
        length: u16,
    ) -> Result<String, DecodeError> {
        if self.remaining == 0 {
            return exhausted_payload(name, length);
        }
        let (in_type, out_type) = unsafe {
            (
                prop.Anonymous1.nonStructType.InType,
                prop.Anonymous1.nonStructType.OutType,
            )
        };
        let map = self.map_info(prop);
        let mut map_ptr = map
            .as_ref()
            .map_or(ptr::null(), |m| m.as_ptr() as *const EVENT_MAP_INFO);
        let mut out = vec![0u16; 256];

        loop {
            let mut size = (out.len() * 2) as u32;
            let mut consumed = 0u16;
            let status = unsafe {
                TdhFormatProperty(
                    self.info.as_ptr(),
                    map_ptr,
                    self.pointer_size,
                    in_type,
                    out_type,
                    length,
                    self.remaining,
                    self.data,
                    &mut size,
                    out.as_mut_ptr(),
                    &mut consumed,
                )
            };
            match status {
                ERROR_SUCCESS => {
                    let consumed = consumed.min(self.remaining);
                    self.data = unsafe { self.data.add(consumed as usize) };
                    self.remaining -= consumed;
                    return Ok(from_wide(&out));
                }
                ERROR_INSUFFICIENT_BUFFER => out.resize((size as usize).div_ceil(2), 0),
                // Value missing from the value map, format it raw.
                ERROR_EVT_INVALID_EVENT_DATA if !map_ptr.is_null() => map_ptr = ptr::null(),
                status => {
                    return Err(DecodeError::Format {
                        name: name.to_string(),
                        status,
                    })
                }
            }
        }
    }
}

/// Value of a property that starts at the end of the payload. Only an
/// explicitly empty property fits there.
fn exhausted_payload(name: &str, length: u16) -> Result<String, DecodeError> {
    if length == 0 {
        Ok(String::new())
    } else {
        Err(DecodeError::Truncated(name.to_string()))
    }
}

/// Parse a formatted integer, decimal or `0x` hex.
fn parse_integer(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
