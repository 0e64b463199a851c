//! Generates the in-sandbox Python entrypoint.
//!
//! The script re-parents stdio into the frame protocol, installs one proxy
//! per exposed tool (plus the `mcp.runtime` helper module) from the catalog
//! serialized into `MCP_AVAILABLE_SERVERS`, runs the user snippet with
//! top-level-await support, and reports completion with a `done` frame.

/// Environment variable carrying the serialized tool catalog for the
/// requested servers.
pub const AVAILABLE_SERVERS_ENV: &str = "MCP_AVAILABLE_SERVERS";
/// Environment variable carrying the names of all discovered servers.
pub const DISCOVERED_SERVERS_ENV: &str = "MCP_DISCOVERED_SERVERS";

/// Renders the entrypoint with the user code embedded as a literal.
pub fn render(code: &str) -> String {
    // A JSON string is also a valid Python string literal: serde_json only
    // escapes quotes, backslashes and control characters, and emits all
    // other characters as raw UTF-8.
    let code_literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    TEMPLATE.replace("__CODE_LITERAL__", &code_literal)
}

const TEMPLATE: &str = r##"import asyncio
import inspect
import json
import os
import sys
import traceback
import types
from contextlib import suppress

AVAILABLE_SERVERS = json.loads(os.environ.get("MCP_AVAILABLE_SERVERS", "[]"))
DISCOVERED_SERVERS = json.loads(os.environ.get("MCP_DISCOVERED_SERVERS", "[]"))
CODE = __CODE_LITERAL__

_PENDING = {}
_NEXT_ID = 0
_READER_TASK = None


class MCPError(RuntimeError):
    'Raised when a bridge RPC fails.'


def _send(message):
    sys.__stdout__.write(json.dumps(message, separators=(",", ":")) + "\n")
    sys.__stdout__.flush()


class _StreamProxy:
    def __init__(self, kind):
        self._kind = kind

    def write(self, data):
        if not data:
            return
        _send({"kind": self._kind, "data": data})

    def flush(self):
        pass

    def isatty(self):
        return False


sys.stdout = _StreamProxy("stdout")
sys.stderr = _StreamProxy("stderr")


async def _stdin_reader():
    loop = asyncio.get_running_loop()
    reader = asyncio.StreamReader()
    protocol = asyncio.StreamReaderProtocol(reader)
    transport = None
    try:
        transport, _ = await loop.connect_read_pipe(lambda: protocol, sys.stdin)
        while True:
            line = await reader.readline()
            if not line:
                break
            try:
                message = json.loads(line.decode())
            except Exception:
                continue
            if message.get("kind") != "response":
                continue
            future = _PENDING.pop(message.get("id"), None)
            if future is None or future.done():
                continue
            if message.get("ok"):
                future.set_result(message.get("result"))
            else:
                error = message.get("error") or {}
                code = error.get("code", "error")
                detail = error.get("message", "RPC error")
                future.set_exception(MCPError(f"{code}: {detail}"))
    finally:
        if transport is not None:
            transport.close()
        for future in list(_PENDING.values()):
            if not future.done():
                future.set_exception(MCPError("RPC channel closed"))


async def _ensure_reader():
    global _READER_TASK
    if _READER_TASK is None:
        _READER_TASK = asyncio.create_task(_stdin_reader())


async def _rpc(method, params=None):
    await _ensure_reader()
    global _NEXT_ID
    _NEXT_ID += 1
    request_id = _NEXT_ID
    future = asyncio.get_running_loop().create_future()
    _PENDING[request_id] = future
    _send({"kind": "request", "id": request_id, "method": method, "params": params or {}})
    return await future


def _install_mcp_modules():
    mcp_pkg = types.ModuleType("mcp")
    mcp_pkg.__path__ = []
    mcp_pkg.__all__ = ["runtime", "servers"]
    sys.modules["mcp"] = mcp_pkg

    runtime_module = types.ModuleType("mcp.runtime")
    servers_module = types.ModuleType("mcp.servers")
    servers_module.__path__ = []
    sys.modules["mcp.runtime"] = runtime_module
    sys.modules["mcp.servers"] = servers_module
    mcp_pkg.runtime = runtime_module
    mcp_pkg.servers = servers_module

    _CAPABILITY_SUMMARY = (
        "locked-down Python sandbox; load MCP servers via the 'servers' argument. "
        "After `import mcp.runtime as runtime`, use runtime.list_servers_sync()/await "
        "runtime.list_servers(), runtime.discovered_servers(), runtime.list_tools[_sync](server), "
        "runtime.query_tool_docs[_sync], runtime.search_tool_docs[_sync], runtime.describe_server(), "
        "runtime.list_loaded_server_metadata(), runtime.capability_summary(). "
        "Loaded servers expose mcp_<alias> proxies."
    )

    _LOADED = tuple(server.get("name") for server in AVAILABLE_SERVERS if server.get("name"))

    def _lookup_server(name):
        for server in AVAILABLE_SERVERS:
            if server.get("name") == name:
                return server
        raise MCPError(f"Server {name!r} is not loaded")

    def _normalise_detail(value):
        detail = str(value).lower() if value is not None else "summary"
        return detail if detail in {"summary", "full"} else "summary"

    def _format_tool_doc(server_info, tool_info, detail):
        doc = {
            "server": server_info.get("name"),
            "serverAlias": server_info.get("alias"),
            "tool": tool_info.get("name"),
            "toolAlias": tool_info.get("alias"),
        }
        description = tool_info.get("description")
        if description:
            doc["description"] = description
        if detail == "full" and tool_info.get("input_schema") is not None:
            doc["inputSchema"] = tool_info.get("input_schema")
        return doc

    async def call_tool(server, tool, arguments=None, timeout=None):
        params = {"server": server, "tool": tool, "arguments": arguments or {}}
        if timeout is not None:
            params["timeout"] = timeout
        return await _rpc("call_tool", params)

    async def list_tools(server):
        result = await _rpc("list_tools", {"server": server})
        return list((result or {}).get("tools", []))

    async def list_servers():
        result = await _rpc("list_servers")
        return tuple((result or {}).get("servers", ()))

    def list_servers_sync():
        return _LOADED

    def discovered_servers():
        return tuple(DISCOVERED_SERVERS)

    def describe_server(name):
        return _lookup_server(name)

    def list_loaded_server_metadata():
        return tuple(AVAILABLE_SERVERS)

    def list_tools_sync(server=None):
        if server is None:
            raise MCPError("list_tools_sync(server) requires a server name")
        info = _lookup_server(server)
        return tuple(tool.get("alias") for tool in info.get("tools", ()) or ())

    async def query_tool_docs(server, tool=None, detail="summary"):
        params = {"server": server}
        if tool is not None:
            params["tool"] = tool
        if detail is not None:
            params["detail"] = detail
        result = await _rpc("query_tool_docs", params)
        docs = (result or {}).get("docs", [])
        if tool is not None and isinstance(docs, list) and len(docs) == 1:
            return docs[0]
        return docs

    async def search_tool_docs(query, *, limit=5, detail="summary"):
        params = {"query": query}
        if limit is not None:
            params["limit"] = limit
        if detail is not None:
            params["detail"] = detail
        result = await _rpc("search_tool_docs", params)
        return (result or {}).get("results", [])

    def query_tool_docs_sync(server, tool=None, detail="summary"):
        info = _lookup_server(server)
        detail_value = _normalise_detail(detail)
        tools = info.get("tools", ()) or ()
        if tool is None:
            return [_format_tool_doc(info, tool_info, detail_value) for tool_info in tools]
        if not isinstance(tool, str):
            raise MCPError("'tool' must be a string when provided")
        target = tool.lower()
        for candidate in tools:
            alias_value = str(candidate.get("alias", "")).lower()
            name_value = str(candidate.get("name", "")).lower()
            if target in {alias_value, name_value}:
                return [_format_tool_doc(info, candidate, detail_value)]
        raise MCPError(f"Tool {tool!r} not found for server {server}")

    def search_tool_docs_sync(query, *, limit=5, detail="summary"):
        tokens = [token for token in str(query).lower().split() if token]
        if not tokens:
            return []
        detail_value = _normalise_detail(detail)
        try:
            capped = max(1, min(20, int(limit)))
        except Exception:
            capped = 5
        matches = []
        for server_info in AVAILABLE_SERVERS:
            server_keywords = " ".join(
                filter(None, (server_info.get("name"), server_info.get("alias")))
            ).lower()
            for tool_info in server_info.get("tools", ()) or ():
                haystack = " ".join(
                    filter(
                        None,
                        (
                            server_keywords,
                            tool_info.get("name"),
                            tool_info.get("alias"),
                            tool_info.get("description"),
                        ),
                    )
                ).lower()
                if all(token in haystack for token in tokens):
                    matches.append(_format_tool_doc(server_info, tool_info, detail_value))
                    if len(matches) >= capped:
                        return matches
        return matches

    async def capability_summary_async():
        result = await _rpc("capability_summary")
        return (result or {}).get("summary", _CAPABILITY_SUMMARY)

    def capability_summary():
        return _CAPABILITY_SUMMARY

    runtime_module.MCPError = MCPError
    runtime_module.call_tool = call_tool
    runtime_module.list_tools = list_tools
    runtime_module.list_tools_sync = list_tools_sync
    runtime_module.list_servers = list_servers
    runtime_module.list_servers_sync = list_servers_sync
    runtime_module.discovered_servers = discovered_servers
    runtime_module.describe_server = describe_server
    runtime_module.list_loaded_server_metadata = list_loaded_server_metadata
    runtime_module.query_tool_docs = query_tool_docs
    runtime_module.query_tool_docs_sync = query_tool_docs_sync
    runtime_module.search_tool_docs = search_tool_docs
    runtime_module.search_tool_docs_sync = search_tool_docs_sync
    runtime_module.capability_summary = capability_summary
    runtime_module.capability_summary_async = capability_summary_async
    runtime_module.__all__ = [
        "MCPError",
        "call_tool",
        "list_tools",
        "list_tools_sync",
        "list_servers",
        "list_servers_sync",
        "discovered_servers",
        "describe_server",
        "list_loaded_server_metadata",
        "query_tool_docs",
        "query_tool_docs_sync",
        "search_tool_docs",
        "search_tool_docs_sync",
        "capability_summary",
    ]

    servers_module.__all__ = []

    def _make_tool_callable(server_name, tool_name):
        async def _invoke(**kwargs):
            return await call_tool(server_name, tool_name, kwargs)

        return _invoke

    for server in AVAILABLE_SERVERS:
        alias = server["alias"]
        module_name = f"mcp.servers.{alias}"
        server_module = types.ModuleType(module_name)
        server_module.__doc__ = f"MCP server '{server['name']}' wrappers"
        server_module.__all__ = []
        tool_map = {}
        for tool in server.get("tools", []):
            tool_alias = tool["alias"]
            summary = (tool.get("description") or "").strip() or (
                f"MCP tool {tool['name']} from {server['name']}"
            )
            func = _make_tool_callable(server["name"], tool["name"])
            func.__name__ = tool_alias
            func.__doc__ = summary
            setattr(server_module, tool_alias, func)
            server_module.__all__.append(tool_alias)
            tool_map[tool_alias] = tool
        server_module.TOOLS = server.get("tools", [])
        server_module.TOOL_MAP = tool_map
        setattr(servers_module, alias, server_module)
        sys.modules[module_name] = server_module
        servers_module.__all__.append(alias)

    return runtime_module


runtime_module = _install_mcp_modules()


class _MCPProxy:
    def __init__(self, server_info):
        self._server_name = server_info["name"]
        self._tools = {tool["alias"]: tool for tool in server_info.get("tools", [])}

    async def list_tools(self):
        result = await _rpc("list_tools", {"server": self._server_name})
        return list((result or {}).get("tools", []))

    def __getattr__(self, tool_alias):
        tool = self._tools.get(tool_alias)
        target = tool.get("name") if tool else tool_alias
        summary = (tool.get("description") if tool else "") or ""

        async def _invoke(_target=target, **kwargs):
            return await runtime_module.call_tool(self._server_name, _target, kwargs)

        if summary:
            _invoke.__doc__ = summary
        _invoke.__name__ = tool_alias
        return _invoke


LOADED_MCP_SERVERS = tuple(server["name"] for server in AVAILABLE_SERVERS)
mcp_servers = {}
for server in AVAILABLE_SERVERS:
    mcp_servers[server["name"]] = _MCPProxy(server)

_ALIAS_MAP = {server["name"]: server["alias"] for server in AVAILABLE_SERVERS}


async def _execute():
    await _ensure_reader()
    namespace = {"__name__": "__sandbox__"}
    namespace["mcp"] = sys.modules["mcp"]
    namespace["mcp_servers"] = mcp_servers
    namespace["LOADED_MCP_SERVERS"] = LOADED_MCP_SERVERS
    for server_name, proxy in mcp_servers.items():
        namespace[f"mcp_{_ALIAS_MAP[server_name]}"] = proxy
    flags = getattr(__import__("ast"), "PyCF_ALLOW_TOP_LEVEL_AWAIT", 0)
    compiled = compile(CODE, "<sandbox>", "exec", flags=flags)
    result = eval(compiled, namespace, namespace)
    if inspect.isawaitable(result):
        await result
    if _READER_TASK is not None:
        _READER_TASK.cancel()
        with suppress(asyncio.CancelledError):
            await _READER_TASK


try:
    asyncio.run(_execute())
except SystemExit:
    raise
except BaseException as exc:
    traceback.print_exc()
    _send({"kind": "done", "status": "error", "error": str(exc) or exc.__class__.__name__})
    sys.exit(1)
else:
    _send({"kind": "done", "status": "ok"})
"##;
